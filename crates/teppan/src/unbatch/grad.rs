use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::communication::{DoneCallback, OpContext};
use crate::error::{BatchError, Result};
use crate::tensor::{self, IndexEntry};

/// A still-incomplete batch of per-key tensors. Once every key has arrived
/// the tensors are concatenated in index order and sent through the context.
struct PendingBatch<B: Backend> {
    /// Keys of tensors still missing from this batch.
    missing_tensors: HashSet<u64>,
    batch_index: Vec<IndexEntry>,
    context: Arc<OpContext<B>>,
    done: DoneCallback,
}

/// A batch whose tensors are all present, popped from the maps and ready to
/// be concatenated and delivered outside the lock.
struct ReadyBatch<B: Backend> {
    tensors: Vec<B>,
    context: Arc<OpContext<B>>,
    done: DoneCallback,
}

struct GradState<B: Backend> {
    /// Tensors waiting for the rest of their batch, by batch key.
    available_tensors: HashMap<u64, B>,
    /// Incomplete batches, keyed by the batch key of the invocation that
    /// will output the concatenated result.
    available_batches: HashMap<u64, PendingBatch<B>>,
    /// Missing-tensor key to the batch key of the batch that wants it.
    desired_tensor_to_batch: HashMap<u64, u64>,
}

impl<B: Backend> Default for GradState<B> {
    fn default() -> Self {
        Self {
            available_tensors: HashMap::new(),
            available_batches: HashMap::new(),
            desired_tensor_to_batch: HashMap::new(),
        }
    }
}

impl<B: Backend> GradState<B> {
    /// Pops the tensor for every index row, in row order.
    fn take_batch_tensors(&mut self, batch_index: &[IndexEntry]) -> Result<Vec<B>> {
        batch_index
            .iter()
            .map(|entry| {
                self.available_tensors
                    .remove(&entry.key)
                    .ok_or_else(|| BatchError::internal("bad bookkeeping of available tensors"))
            })
            .collect()
    }
}

/// Accumulates per-key tensors and emits them, concatenated in the order
/// given by the driving invocation's batch index, once all keys are present.
pub struct UnbatchGradResource<B: Backend> {
    state: Mutex<GradState<B>>,
}

impl<B: Backend> Default for UnbatchGradResource<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> UnbatchGradResource<B> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GradState::default()),
        }
    }

    /// Ingests data from one invocation.
    ///
    /// `grad` is this invocation's per-key tensor. The invocation whose
    /// `data` has elements drives the batch: its `batch_index` fixes the
    /// output order, and its `context`/`done` receive the concatenated
    /// result once every indexed key has arrived. Invocations with empty
    /// `data` receive an empty tensor immediately.
    pub fn compute(
        &self,
        data: &B,
        batch_index: &[IndexEntry],
        grad: B,
        batch_key: u64,
        context: Arc<OpContext<B>>,
        done: DoneCallback,
    ) -> Result<()> {
        let mut empty_done: Option<DoneCallback> = None;
        let mut ready: Vec<ReadyBatch<B>> = Vec::new();

        let status = {
            let mut state = self.state.lock().unwrap();
            'critical: {
                // Mark our tensor as available.
                if state.available_tensors.contains_key(&batch_key) {
                    break 'critical Err(BatchError::InvalidArgument(
                        "two invocations with the same batch key".into(),
                    ));
                }
                state.available_tensors.insert(batch_key, grad.clone());

                let has_elements = data.shape().iter().product::<usize>() > 0;
                if has_elements {
                    if batch_index.is_empty() {
                        break 'critical Err(BatchError::InvalidArgument(
                            "batch index is empty while the data tensor is not".into(),
                        ));
                    }
                    let missing: HashSet<u64> = batch_index
                        .iter()
                        .map(|entry| entry.key)
                        .filter(|key| !state.available_tensors.contains_key(key))
                        .collect();
                    if missing.is_empty() {
                        match state.take_batch_tensors(batch_index) {
                            Ok(tensors) => {
                                ready.push(ReadyBatch {
                                    tensors,
                                    context: context.clone(),
                                    done,
                                });
                                break 'critical Ok(());
                            }
                            Err(error) => break 'critical Err(error),
                        }
                    }
                    if state.available_batches.contains_key(&batch_key) {
                        break 'critical Err(BatchError::InvalidArgument(
                            "batch key with a valid batch used twice".into(),
                        ));
                    }
                    state.available_batches.insert(
                        batch_key,
                        PendingBatch {
                            missing_tensors: missing.clone(),
                            batch_index: batch_index.to_vec(),
                            context: context.clone(),
                            done,
                        },
                    );
                    for key in &missing {
                        if state.desired_tensor_to_batch.contains_key(key) {
                            break 'critical Err(BatchError::InvalidArgument(
                                "missing tensor wanted by more than one batch".into(),
                            ));
                        }
                        state.desired_tensor_to_batch.insert(*key, batch_key);
                    }
                } else {
                    // Nothing to drive here; emit an empty tensor of the
                    // grad's trailing shape and finish this invocation.
                    context.set_output(0, grad.slice(0, 0));
                    empty_done = Some(done);
                }

                // Our tensor may be the one an existing batch is waiting on.
                if let Some(owner) = state.desired_tensor_to_batch.remove(&batch_key) {
                    let completed = match state.available_batches.get_mut(&owner) {
                        None => {
                            break 'critical Err(BatchError::InvalidArgument(
                                "batch no longer exists".into(),
                            ));
                        }
                        Some(batch) => {
                            batch.missing_tensors.remove(&batch_key);
                            batch.missing_tensors.is_empty()
                        }
                    };
                    if completed {
                        if let Some(batch) = state.available_batches.remove(&owner) {
                            match state.take_batch_tensors(&batch.batch_index) {
                                Ok(tensors) => ready.push(ReadyBatch {
                                    tensors,
                                    context: batch.context,
                                    done: batch.done,
                                }),
                                Err(error) => break 'critical Err(error),
                            }
                        }
                    }
                }

                Ok(())
            }
        };

        // Deliveries and callbacks happen outside the lock.
        if let Some(done) = empty_done {
            done();
        }
        for batch in ready {
            match tensor::concat(&batch.tensors) {
                Ok(output) => batch.context.set_output(0, output),
                Err(error) => batch.context.fail(error),
            }
            (batch.done)();
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockTensor;
    use crate::communication::done_channel;

    fn empty_data() -> MockTensor {
        MockTensor::counting(0, 1, 0.0)
    }

    #[tokio::test]
    async fn grads_emit_in_index_order() {
        let resource = UnbatchGradResource::new();
        let index = vec![
            IndexEntry::new(1, 0, 1),
            IndexEntry::new(2, 1, 4),
            IndexEntry::new(3, 4, 6),
        ];

        // The driving invocation (key 3) arrives first.
        let driver_context = OpContext::new(1);
        let (driver_done, driver_rx) = done_channel();
        resource
            .compute(
                &MockTensor::counting(6, 1, 0.0),
                &index,
                MockTensor::counting(2, 1, 20.0),
                3,
                driver_context.clone(),
                driver_done,
            )
            .unwrap();

        // Keys 1 and 2 contribute their grads with empty data.
        let first_context = OpContext::new(1);
        let (first_done, first_rx) = done_channel();
        resource
            .compute(
                &empty_data(),
                &[],
                MockTensor::counting(1, 1, 0.0),
                1,
                first_context.clone(),
                first_done,
            )
            .unwrap();
        first_rx.await.unwrap();
        // Non-driving invocations get an empty, grad-shaped output.
        assert_eq!(first_context.take_outputs().unwrap()[0].shape(), vec![0, 1]);

        let second_context = OpContext::new(1);
        let (second_done, _second_rx) = done_channel();
        resource
            .compute(
                &empty_data(),
                &[],
                MockTensor::counting(3, 1, 10.0),
                2,
                second_context,
                second_done,
            )
            .unwrap();

        driver_rx.await.unwrap();
        let outputs = driver_context.take_outputs().unwrap();
        assert_eq!(outputs[0].data(), &[0.0, 10.0, 11.0, 12.0, 20.0, 21.0]);
    }

    #[tokio::test]
    async fn driver_with_all_grads_present_emits_immediately() {
        let resource = UnbatchGradResource::new();

        let first_context = OpContext::new(1);
        let (first_done, _first_rx) = done_channel();
        resource
            .compute(
                &empty_data(),
                &[],
                MockTensor::counting(2, 1, 0.0),
                1,
                first_context,
                first_done,
            )
            .unwrap();

        let index = vec![IndexEntry::new(1, 0, 2), IndexEntry::new(2, 2, 3)];
        let driver_context = OpContext::new(1);
        let (driver_done, driver_rx) = done_channel();
        resource
            .compute(
                &MockTensor::counting(3, 1, 0.0),
                &index,
                MockTensor::counting(1, 1, 50.0),
                2,
                driver_context.clone(),
                driver_done,
            )
            .unwrap();

        driver_rx.await.unwrap();
        let outputs = driver_context.take_outputs().unwrap();
        assert_eq!(outputs[0].data(), &[0.0, 1.0, 50.0]);
    }

    #[tokio::test]
    async fn duplicate_batch_key_is_rejected() {
        let resource = UnbatchGradResource::new();

        let first_context = OpContext::new(1);
        let (first_done, _rx) = done_channel();
        resource
            .compute(
                &empty_data(),
                &[],
                MockTensor::counting(1, 1, 0.0),
                7,
                first_context,
                first_done,
            )
            .unwrap();

        let second_context = OpContext::new(1);
        let (second_done, _rx) = done_channel();
        let err = resource
            .compute(
                &empty_data(),
                &[],
                MockTensor::counting(1, 1, 0.0),
                7,
                second_context,
                second_done,
            )
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn nonempty_data_requires_an_index() {
        let resource = UnbatchGradResource::new();
        let context = OpContext::new(1);
        let (done, _rx) = done_channel();
        let err = resource
            .compute(
                &MockTensor::counting(2, 1, 0.0),
                &[],
                MockTensor::counting(2, 1, 0.0),
                1,
                context,
                done,
            )
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }
}
