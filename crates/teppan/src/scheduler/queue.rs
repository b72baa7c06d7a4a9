use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::config::QueueOptions;
use crate::error::{BatchError, Result};

use super::{Batch, BatchProcessor, SchedulerTask};

/// Splits a task across batches: `(task, first_piece_size, max_piece_size)`
/// must yield pieces whose sizes follow [`split_task_sizes`].
pub type TaskSplitter<T> = Arc<dyn Fn(T, usize, usize) -> Result<Vec<T>> + Send + Sync>;

/// A `schedule` failure. Admission errors hand the rejected task back to the
/// caller so its completion callback is never consumed by the scheduler.
pub struct ScheduleError<T> {
    pub error: BatchError,
    pub task: Option<T>,
}

impl<T> ScheduleError<T> {
    fn rejected(error: BatchError, task: T) -> Self {
        Self {
            error,
            task: Some(task),
        }
    }
}

impl<T> fmt::Debug for ScheduleError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleError")
            .field("error", &self.error)
            .field("task_returned", &self.task.is_some())
            .finish()
    }
}

impl<T> From<ScheduleError<T>> for BatchError {
    fn from(err: ScheduleError<T>) -> Self {
        err.error
    }
}

/// Piece sizes for splitting a task of `total` rows into an open batch with
/// `remaining` free rows and subsequent batches of capacity `max`:
/// `[remaining, max, max, ..., leftover]`, with a zero-sized leading piece
/// dropped. Sizes always sum to `total`.
pub fn split_task_sizes(total: usize, remaining: usize, max: usize) -> Vec<usize> {
    let first = remaining.min(total);
    let mut sizes = Vec::new();
    if first > 0 {
        sizes.push(first);
    }
    let mut left = total - first;
    while left > 0 {
        let next = left.min(max);
        sizes.push(next);
        left -= next;
    }
    sizes
}

struct QueueState<T> {
    open: Vec<T>,
    open_size: usize,
    open_since: Option<Instant>,
    closed: VecDeque<Batch<T>>,
}

impl<T: SchedulerTask> QueueState<T> {
    fn new() -> Self {
        Self {
            open: Vec::new(),
            open_size: 0,
            open_since: None,
            closed: VecDeque::new(),
        }
    }

    /// Closed batches plus the open batch when it holds at least one task.
    fn enqueued_batches(&self) -> usize {
        self.closed.len() + usize::from(!self.open.is_empty())
    }

    fn push_open(&mut self, task: T) {
        if self.open.is_empty() {
            self.open_since = Some(Instant::now());
        }
        self.open_size += task.size();
        self.open.push(task);
    }

    fn close_open(&mut self) {
        if self.open.is_empty() {
            return;
        }
        let tasks = std::mem::take(&mut self.open);
        self.open_size = 0;
        self.open_since = None;
        self.closed.push_back(Batch::new(tasks));
    }
}

/// One named queue's batching state machine.
pub(crate) struct SchedulerQueue<T: SchedulerTask> {
    options: QueueOptions,
    splitter: Option<TaskSplitter<T>>,
    processor: Arc<dyn BatchProcessor<T>>,
    state: Mutex<QueueState<T>>,
}

impl<T: SchedulerTask> SchedulerQueue<T> {
    pub fn new(
        options: QueueOptions,
        processor: Arc<dyn BatchProcessor<T>>,
        splitter: Option<TaskSplitter<T>>,
    ) -> Self {
        Self {
            options,
            splitter,
            processor,
            state: Mutex::new(QueueState::new()),
        }
    }

    /// Places `task`, returning the number of batches that closed as a
    /// result. Capacity is checked before any mutation, so a rejected task
    /// leaves the queue untouched.
    pub fn schedule(&self, task: T) -> std::result::Result<usize, ScheduleError<T>> {
        let limit = self.options.execution_batch_size_limit();
        let mut state = self.state.lock().unwrap();
        let remaining = limit - state.open_size;
        let mut newly_closed = 0;

        if task.size() <= remaining {
            if state.open.is_empty()
                && state.enqueued_batches() + 1 > self.options.max_enqueued_batches
            {
                return Err(ScheduleError::rejected(
                    BatchError::ResourceExhausted(format!(
                        "too many enqueued batches; max_enqueued_batches is {}",
                        self.options.max_enqueued_batches
                    )),
                    task,
                ));
            }
            state.push_open(task);
            if state.open_size >= limit {
                state.close_open();
                newly_closed += 1;
            }
        } else if let Some(splitter) = &self.splitter {
            let sizes = split_task_sizes(task.size(), remaining, limit);
            let last = *sizes.last().unwrap_or(&0);
            let closes = sizes.len().saturating_sub(1) + usize::from(last == limit);
            let projected = state.closed.len() + closes + usize::from(last < limit);
            if projected > self.options.max_enqueued_batches {
                return Err(ScheduleError::rejected(
                    BatchError::ResourceExhausted(format!(
                        "splitting this task would exceed max_enqueued_batches of {}",
                        self.options.max_enqueued_batches
                    )),
                    task,
                ));
            }

            let pieces = splitter(task, remaining, limit).map_err(|error| ScheduleError {
                error,
                task: None,
            })?;
            for piece in pieces {
                state.push_open(piece);
                if state.open_size >= limit {
                    state.close_open();
                    newly_closed += 1;
                }
            }
        } else {
            if task.size() > self.options.max_batch_size {
                return Err(ScheduleError::rejected(
                    BatchError::InvalidArgument(format!(
                        "task size {} exceeds max_batch_size {} and large batch splitting \
                         is disabled",
                        task.size(),
                        self.options.max_batch_size
                    )),
                    task,
                ));
            }
            let will_close = !state.open.is_empty();
            let projected = state.closed.len() + usize::from(will_close) + 1;
            if projected > self.options.max_enqueued_batches {
                return Err(ScheduleError::rejected(
                    BatchError::ResourceExhausted(format!(
                        "too many enqueued batches; max_enqueued_batches is {}",
                        self.options.max_enqueued_batches
                    )),
                    task,
                ));
            }
            if will_close {
                state.close_open();
                newly_closed += 1;
            }
            state.push_open(task);
            if state.open_size >= limit {
                state.close_open();
                newly_closed += 1;
            }
        }

        Ok(newly_closed)
    }

    /// Pops the next closed batch, closing the open batch first if its
    /// timeout has elapsed.
    pub fn take_ready_batch(&self) -> Option<Batch<T>> {
        let mut state = self.state.lock().unwrap();
        if let Some(batch) = state.closed.pop_front() {
            return Some(batch);
        }
        if !state.open.is_empty() {
            if let Some(since) = state.open_since {
                let timeout = Duration::from_micros(self.options.batch_timeout_micros);
                if since.elapsed() >= timeout {
                    state.close_open();
                    return state.closed.pop_front();
                }
            }
        }
        None
    }

    pub async fn process(&self, batch: Batch<T>) {
        self.processor.process_batch(batch).await;
    }
}

/// Submission handle for one queue of a [`super::BatchScheduler`].
pub struct QueueHandle<T: SchedulerTask> {
    pub(crate) queue: Arc<SchedulerQueue<T>>,
    pub(crate) notifier: Arc<Notify>,
}

impl<T: SchedulerTask> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

impl<T: SchedulerTask> QueueHandle<T> {
    /// Schedules a task onto this queue.
    ///
    /// Returns immediately; the task's completion callback fires later, once
    /// its batch has been processed. On an admission error the task is
    /// handed back inside the [`ScheduleError`] and no callback fires.
    pub fn schedule(&self, task: T) -> std::result::Result<(), ScheduleError<T>> {
        let newly_closed = self.queue.schedule(task)?;
        for _ in 0..newly_closed {
            self.notifier.notify_one();
        }
        Ok(())
    }
}
