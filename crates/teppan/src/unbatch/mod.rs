//! # Unbatch rendezvous
//!
//! Re-pairs slices of a batched tensor with the submissions that produced
//! them, keyed by batch key.
//!
//! The resource keeps two maps indexed by batch key: one holds the
//! callbacks of callers that are waiting for their tensor, the other holds
//! tensor slices that arrived before their caller. Whenever a caller shows
//! up, it either grabs its tensor if one is waiting, or enlists itself and
//! then distributes any slices it carries to the callers they belong to.
//! A periodic evictor enforces per-waiter deadlines.

mod grad;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{
    atomic::Ordering,
    Arc, Mutex,
};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::backend::Backend;
use crate::communication::{DoneCallback, OpContext};
use crate::error::{BatchError, Result};
use crate::scheduler::WorkerPool;
use crate::tensor::{self, IndexEntry};

pub use grad::UnbatchGradResource;

/// How often waiter deadlines are enforced.
const EVICTION_INTERVAL: Duration = Duration::from_millis(1);

struct WaitingTensor<B> {
    deadline: Instant,
    tensor: B,
}

struct WaitingCallback<B: Backend> {
    deadline: Instant,
    context: Arc<OpContext<B>>,
    done: DoneCallback,
}

struct UnbatchState<B: Backend> {
    waiting_tensors: HashMap<u64, WaitingTensor<B>>,
    waiting_callbacks: HashMap<u64, WaitingCallback<B>>,
}

impl<B: Backend> Default for UnbatchState<B> {
    fn default() -> Self {
        Self {
            waiting_tensors: HashMap::new(),
            waiting_callbacks: HashMap::new(),
        }
    }
}

struct UnbatchShared<B: Backend> {
    state: Mutex<UnbatchState<B>>,
}

impl<B: Backend> UnbatchShared<B> {
    /// Evicts waiting tensors and callbacks that have exceeded their
    /// deadline. Expired tensors vanish silently; expired callbacks receive
    /// a deadline-exceeded status.
    fn enforce_timeout(&self) {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.waiting_tensors.retain(|_, w| w.deadline >= now);

            let expired: Vec<u64> = state
                .waiting_callbacks
                .iter()
                .filter(|(_, w)| w.deadline < now)
                .map(|(key, _)| *key)
                .collect();
            for key in expired {
                if let Some(waiting) = state.waiting_callbacks.remove(&key) {
                    evicted.push((key, waiting));
                }
            }
        }

        for (key, waiting) in evicted {
            warn!(batch_key = key, "batched data did not arrive within the timeout window");
            waiting.context.fail(BatchError::DeadlineExceeded(
                "batched data did not arrive within the timeout window".into(),
            ));
            (waiting.done)();
        }
    }
}

/// The state and logic for unbatching tensors.
pub struct UnbatchResource<B: Backend> {
    timeout: Duration,
    shared: Arc<UnbatchShared<B>>,
    // Keeps the deadline evictor alive; stops it on drop.
    _evictor: WorkerPool,
}

impl<B: Backend> UnbatchResource<B> {
    /// Creates the resource and spawns its deadline evictor. Must be called
    /// from within a tokio runtime.
    pub fn new(timeout_micros: u64) -> Self {
        let shared = Arc::new(UnbatchShared {
            state: Mutex::new(UnbatchState::default()),
        });
        let evictor = WorkerPool::new(1, |running, notifier| {
            let shared = shared.clone();
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    let _ = tokio::time::timeout(EVICTION_INTERVAL, notifier.notified()).await;
                    shared.enforce_timeout();
                }
            })
        });

        Self {
            timeout: Duration::from_micros(timeout_micros),
            shared,
            _evictor: evictor,
        }
    }

    /// Ingests data from one invocation.
    ///
    /// `data` carries the batched tensor on the invocation downstream of the
    /// batch op (its `batch_index` then describes the per-key row ranges,
    /// usually including `batch_key` itself); other invocations arrive with
    /// an empty index and rely on a data-carrying peer to serve them. The
    /// caller's output is delivered on slot 0 of `context`, either
    /// immediately or once its slice arrives, and `done` fires after
    /// delivery or on deadline expiry.
    pub fn compute(
        &self,
        data: B,
        batch_index: &[IndexEntry],
        batch_key: u64,
        context: Arc<OpContext<B>>,
        done: DoneCallback,
    ) -> Result<()> {
        if batch_index.len() > data.num_rows() {
            return Err(BatchError::InvalidArgument(format!(
                "wrong shape for index: expected at most {} entries, got {}",
                data.num_rows(),
                batch_index.len()
            )));
        }

        // Slice the data up outside of the critical section below.
        let nonempty_input = !batch_index.is_empty();
        let mut split_inputs = Vec::new();
        if nonempty_input {
            let sizes: Vec<usize> = batch_index.iter().map(|entry| entry.len()).collect();
            split_inputs = tensor::split(&data, &sizes)?;
        }

        let mut callbacks_to_call: Vec<DoneCallback> = Vec::new();
        let status = {
            let mut state = self.shared.state.lock().unwrap();
            'critical: {
                // The tensor we want may already be here.
                if let Some(waiting) = state.waiting_tensors.remove(&batch_key) {
                    context.set_output(0, waiting.tensor);
                    callbacks_to_call.push(done);
                    break 'critical Ok(());
                }

                let deadline = Instant::now() + self.timeout;

                // Add ourselves to the waitlist for tensors.
                match state.waiting_callbacks.entry(batch_key) {
                    Entry::Occupied(_) => {
                        break 'critical Err(BatchError::AlreadyExists(
                            "multiple invocations with the same batch key".into(),
                        ));
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(WaitingCallback {
                            deadline,
                            context: context.clone(),
                            done,
                        });
                    }
                }

                // Finish any waitlisted invocations we carry slices for, and
                // store the remaining slices.
                if nonempty_input {
                    for (entry, piece) in batch_index.iter().zip(split_inputs) {
                        if let Some(waiting) = state.waiting_callbacks.remove(&entry.key) {
                            waiting.context.set_output(0, piece);
                            callbacks_to_call.push(waiting.done);
                        } else {
                            // The deadline also covers a late arrival whose
                            // waiter has already timed out and left.
                            match state.waiting_tensors.entry(entry.key) {
                                Entry::Occupied(_) => {
                                    break 'critical Err(BatchError::AlreadyExists(
                                        "multiple tensors returned for the same batch key".into(),
                                    ));
                                }
                                Entry::Vacant(slot) => {
                                    slot.insert(WaitingTensor {
                                        deadline,
                                        tensor: piece,
                                    });
                                }
                            }
                        }
                    }
                }

                Ok(())
            }
        };

        for callback in callbacks_to_call {
            callback();
        }
        status
    }
}
