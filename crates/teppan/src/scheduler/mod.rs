//! # Batch Scheduler
//!
//! Groups heterogeneously-arriving tasks into batches under per-queue
//! size/time/backlog policies and dispatches closed batches to a fixed pool
//! of worker tasks shared across all queues.
//!
//! A batch closes when it reaches the queue's execution size limit, when
//! task placement forces a new batch open, or when the batch timeout has
//! elapsed since its first task arrived. Workers pull closed batches in
//! close order within a queue and round-robin across queues, and stay busy
//! for the full duration of one batch: keeping a worker blocked on the
//! executor bounds concurrent executor invocations to the pool size and
//! gives upstream batches time to coalesce.

mod batch;
mod queue;
mod worker;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::{QueueOptions, SchedulerOptions};
use crate::error::{BatchError, Result};

pub use batch::{Batch, SchedulerTask};
pub use queue::{split_task_sizes, QueueHandle, ScheduleError, TaskSplitter};

use queue::SchedulerQueue;
pub(crate) use worker::WorkerPool;

/// How often idle workers re-check queues for timed-out open batches.
const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Consumes closed batches. One processor is registered per queue; a worker
/// invokes it and awaits the returned future to completion before pulling
/// the next batch.
#[async_trait]
pub trait BatchProcessor<T: SchedulerTask>: Send + Sync + 'static {
    async fn process_batch(&self, batch: Batch<T>);
}

struct SchedulerShared<T: SchedulerTask> {
    queues: Mutex<Vec<Arc<SchedulerQueue<T>>>>,
    next_queue: AtomicUsize,
}

/// The shared batch scheduler: queue registry plus the worker pool.
///
/// Dropping the scheduler stops the workers; batches still enqueued are
/// discarded without being processed.
pub struct BatchScheduler<T: SchedulerTask> {
    shared: Arc<SchedulerShared<T>>,
    workers: WorkerPool,
}

impl<T: SchedulerTask> BatchScheduler<T> {
    /// Creates the scheduler and spawns its workers. Must be called from
    /// within a tokio runtime.
    pub fn new(options: SchedulerOptions) -> Self {
        let shared = Arc::new(SchedulerShared {
            queues: Mutex::new(Vec::new()),
            next_queue: AtomicUsize::new(0),
        });
        let workers = WorkerPool::new(options.num_batch_threads.max(1), |running, notifier| {
            let shared = shared.clone();
            tokio::spawn(dispatch_loop(shared, running, notifier))
        });

        Self { shared, workers }
    }

    /// Registers a queue with its batching policy and batch consumer.
    ///
    /// `splitter` is required when `options.enable_large_batch_splitting`
    /// is set; it turns one oversized task into pieces sized by
    /// [`split_task_sizes`].
    pub fn add_queue(
        &self,
        options: QueueOptions,
        processor: Arc<dyn BatchProcessor<T>>,
        splitter: Option<TaskSplitter<T>>,
    ) -> Result<QueueHandle<T>> {
        options.validate()?;
        if options.enable_large_batch_splitting && splitter.is_none() {
            return Err(BatchError::invalid_argument(
                "enable_large_batch_splitting requires a task splitter",
            ));
        }
        let queue = Arc::new(SchedulerQueue::new(options, processor, splitter));
        let num_queues = {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.push(queue.clone());
            queues.len()
        };
        debug!(num_queues, "registered batching queue");
        Ok(QueueHandle {
            queue,
            notifier: self.workers.notifier(),
        })
    }
}

async fn dispatch_loop<T: SchedulerTask>(
    shared: Arc<SchedulerShared<T>>,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
) {
    while running.load(Ordering::SeqCst) {
        let queues: Vec<_> = shared.queues.lock().unwrap().clone();

        let mut dispatched = false;
        if !queues.is_empty() {
            let start = shared.next_queue.fetch_add(1, Ordering::Relaxed) % queues.len();
            for offset in 0..queues.len() {
                let queue = &queues[(start + offset) % queues.len()];
                if let Some(batch) = queue.take_ready_batch() {
                    queue.process(batch).await;
                    dispatched = true;
                    break;
                }
            }
        }

        if !dispatched {
            // Idle, or all open batches still within their timeout window.
            let _ = tokio::time::timeout(TIMEOUT_POLL_INTERVAL, notifier.notified()).await;
        }
    }
}
