//! # Batch Resource
//!
//! The caller-facing side of batching: accepts one submission's worth of
//! input tensors, schedules it onto a named queue, and delivers the batched
//! computation's outputs back to the submission's context.
//!
//! Queues are created lazily on first use and share one scheduler and its
//! worker pool. In function mode a closed batch is padded, concatenated and
//! run through the [`Executor`]; in legacy batch mode the concatenated
//! inputs are re-emitted together with an index describing each
//! submission's row range, for a downstream unbatch stage to consume.

mod core_trait;
mod process;
mod task;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::backend::Backend;
use crate::communication::{done_channel, DoneCallback, OpContext, OutputHandle};
use crate::config::{QueueOptions, SchedulerOptions};
use crate::error::{BatchError, Result};
use crate::scheduler::{BatchScheduler, QueueHandle, TaskSplitter};

pub use core_trait::Executor;
pub use task::BatchTask;

use process::BatchDispatcher;

/// Generates a fresh 64-bit submission guid.
pub fn new_guid() -> u64 {
    Uuid::new_v4().as_u128() as u64
}

/// The state and logic for batching tensors across concurrent submissions.
pub struct BatchResource<B: Backend> {
    scheduler: BatchScheduler<BatchTask<B>>,
    queue_options: QueueOptions,
    dispatcher: Arc<BatchDispatcher<B>>,
    /// Executor output arity in function mode; `None` in legacy batch mode,
    /// where the arity equals the submission's input count.
    num_function_outputs: Option<usize>,
    queues: Mutex<HashMap<String, QueueHandle<BatchTask<B>>>>,
}

impl<B: Backend> BatchResource<B> {
    /// Function mode: closed batches are run through `executor`, which must
    /// produce `num_outputs` tensors per invocation.
    pub fn for_function(
        scheduler_options: SchedulerOptions,
        queue_options: QueueOptions,
        executor: Arc<dyn Executor<B>>,
        num_outputs: usize,
    ) -> Result<Self> {
        Self::create(scheduler_options, queue_options, Some(executor), Some(num_outputs))
    }

    /// Legacy batch mode: closed batches emit their concatenated inputs and
    /// an index instead of invoking a compute function.
    pub fn for_batch(
        scheduler_options: SchedulerOptions,
        queue_options: QueueOptions,
    ) -> Result<Self> {
        Self::create(scheduler_options, queue_options, None, None)
    }

    fn create(
        scheduler_options: SchedulerOptions,
        queue_options: QueueOptions,
        executor: Option<Arc<dyn Executor<B>>>,
        num_function_outputs: Option<usize>,
    ) -> Result<Self> {
        queue_options.validate()?;
        let dispatcher = Arc::new(BatchDispatcher::new(
            executor,
            queue_options.allowed_batch_sizes.clone(),
        ));
        Ok(Self {
            scheduler: BatchScheduler::new(scheduler_options),
            queue_options,
            dispatcher,
            num_function_outputs,
            queues: Mutex::new(HashMap::new()),
        })
    }

    fn lookup_or_create_queue(&self, queue_name: &str) -> Result<QueueHandle<BatchTask<B>>> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(handle) = queues.get(queue_name) {
            return Ok(handle.clone());
        }
        let splitter: Option<TaskSplitter<BatchTask<B>>> =
            if self.queue_options.enable_large_batch_splitting {
                Some(Arc::new(|task: BatchTask<B>, first_size, max_size| {
                    task.split_into_pieces(first_size, max_size)
                }))
            } else {
                None
            };
        let handle =
            self.scheduler
                .add_queue(self.queue_options.clone(), self.dispatcher.clone(), splitter)?;
        queues.insert(queue_name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Ingests data from one submission. The inputs are enqueued to be
    /// combined with others into a batch, asynchronously; `done` fires once
    /// the outputs (or the failure status) have been delivered to `context`.
    ///
    /// Validation errors are returned synchronously, and the callback is
    /// never invoked on a synchronous error.
    pub fn register_input(
        &self,
        guid: u64,
        queue_name: &str,
        inputs: Vec<B>,
        captured_inputs: Vec<B>,
        context: Arc<OpContext<B>>,
        done: DoneCallback,
    ) -> Result<()> {
        if inputs.is_empty() {
            return Err(BatchError::invalid_argument(
                "batching requires at least one input tensor",
            ));
        }
        for input in &inputs {
            if input.shape().is_empty() {
                return Err(BatchError::invalid_argument(
                    "batching input tensors must have at least one dimension",
                ));
            }
        }
        let leading = inputs[0].num_rows();
        if inputs.iter().any(|input| input.num_rows() != leading) {
            return Err(BatchError::invalid_argument(
                "batching input tensors supplied in a given invocation must have equal \
                 leading-dimension size",
            ));
        }
        debug!(input_batch_size = leading, queue = queue_name, "registering input");

        let task = BatchTask::new(guid, inputs, captured_inputs, context, done);
        let queue = self.lookup_or_create_queue(queue_name)?;
        queue.schedule(task).map_err(BatchError::from)
    }

    /// Submits one invocation and returns an awaitable handle to its
    /// outputs. The handle's context also carries the index and id slots in
    /// legacy batch mode.
    pub fn submit(
        &self,
        queue_name: &str,
        inputs: Vec<B>,
        captured_inputs: Vec<B>,
    ) -> Result<OutputHandle<B>> {
        let num_outputs = self.num_function_outputs.unwrap_or(inputs.len());
        let context = OpContext::new(num_outputs);
        let (done, receiver) = done_channel();
        self.register_input(
            new_guid(),
            queue_name,
            inputs,
            captured_inputs,
            context.clone(),
            done,
        )?;
        Ok(OutputHandle::new(context, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockTensor;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::Mutex as StdMutex;

    /// Returns the batched tensor unchanged, recording every argument list.
    struct EchoExecutor {
        seen: StdMutex<Vec<Vec<MockTensor>>>,
    }

    impl EchoExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn seen_arg_shapes(&self) -> Vec<Vec<Vec<usize>>> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|args| args.iter().map(|t| t.shape()).collect())
                .collect()
        }
    }

    #[async_trait]
    impl Executor<MockTensor> for EchoExecutor {
        async fn run(&self, args: Vec<MockTensor>) -> Result<Vec<MockTensor>> {
            self.seen.lock().unwrap().push(args.clone());
            Ok(vec![args[0].clone()])
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl Executor<MockTensor> for FailingExecutor {
        async fn run(&self, _args: Vec<MockTensor>) -> Result<Vec<MockTensor>> {
            Err(BatchError::internal("executor exploded"))
        }
    }

    fn function_resource(
        queue_options: QueueOptions,
        executor: Arc<dyn Executor<MockTensor>>,
    ) -> BatchResource<MockTensor> {
        BatchResource::for_function(SchedulerOptions::default(), queue_options, executor, 1)
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_submissions_share_one_batch() {
        let executor = EchoExecutor::new();
        let options = QueueOptions {
            max_batch_size: 8,
            batch_timeout_micros: 60_000_000,
            allowed_batch_sizes: vec![4, 8],
            ..Default::default()
        };
        let resource = function_resource(options, executor.clone());

        let first = resource
            .submit("q", vec![MockTensor::counting(3, 2, 0.0)], vec![])
            .unwrap();
        let second = resource
            .submit("q", vec![MockTensor::counting(5, 2, 100.0)], vec![])
            .unwrap();

        let results = join_all(vec![first, second]).await;
        let first_out = results[0].as_ref().unwrap();
        let second_out = results[1].as_ref().unwrap();

        assert_eq!(first_out[0], MockTensor::counting(3, 2, 0.0));
        assert_eq!(second_out[0], MockTensor::counting(5, 2, 100.0));

        // One execution of the full, unpadded batch of 8.
        assert_eq!(executor.seen_arg_shapes(), vec![vec![vec![8, 2]]]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lone_submission_is_padded_to_the_allowed_size() {
        let executor = EchoExecutor::new();
        let options = QueueOptions {
            max_batch_size: 8,
            batch_timeout_micros: 10_000,
            allowed_batch_sizes: vec![4, 8],
            ..Default::default()
        };
        let resource = function_resource(options, executor.clone());

        let handle = resource
            .submit("q", vec![MockTensor::counting(3, 1, 1.0)], vec![])
            .unwrap();
        let outputs = handle.await.unwrap();

        // The caller sees only its own rows.
        assert_eq!(outputs[0].data(), &[1.0, 2.0, 3.0]);

        // The executor saw one padding row, copied from row 0.
        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0].shape(), vec![4, 1]);
        assert_eq!(seen[0][0].data(), &[1.0, 2.0, 3.0, 1.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn split_submission_reassembles_in_piece_order() {
        let executor = EchoExecutor::new();
        let options = QueueOptions {
            max_batch_size: 4,
            batch_timeout_micros: 5_000,
            enable_large_batch_splitting: true,
            allowed_batch_sizes: vec![2, 4],
            ..Default::default()
        };
        let resource = BatchResource::for_function(
            SchedulerOptions {
                num_batch_threads: 1,
            },
            options,
            executor.clone(),
            1,
        )
        .unwrap();

        // Leave one open slot, then submit 7 rows: pieces of 1, 4 and 2.
        let small = resource
            .submit("q", vec![MockTensor::counting(3, 1, 100.0)], vec![])
            .unwrap();
        let large = resource
            .submit("q", vec![MockTensor::counting(7, 1, 0.0)], vec![])
            .unwrap();

        let small_out = small.await.unwrap();
        assert_eq!(small_out[0].data(), &[100.0, 101.0, 102.0]);

        let large_out = large.await.unwrap();
        assert_eq!(
            large_out[0].data(),
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );

        // Three executions: 3+1, 4, and the leftover 2 (padded to 2 exactly).
        assert_eq!(
            executor.seen_arg_shapes(),
            vec![vec![vec![4, 1]], vec![vec![4, 1]], vec![vec![2, 1]]]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn executor_failure_reaches_every_submission() {
        let options = QueueOptions {
            max_batch_size: 4,
            batch_timeout_micros: 5_000,
            ..Default::default()
        };
        let resource = function_resource(options, Arc::new(FailingExecutor));

        let first = resource
            .submit("q", vec![MockTensor::counting(1, 1, 0.0)], vec![])
            .unwrap();
        let second = resource
            .submit("q", vec![MockTensor::counting(1, 1, 0.0)], vec![])
            .unwrap();

        assert_eq!(first.await, Err(BatchError::internal("executor exploded")));
        assert_eq!(second.await, Err(BatchError::internal("executor exploded")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn executor_failure_reaches_split_submissions() {
        let options = QueueOptions {
            max_batch_size: 2,
            batch_timeout_micros: 5_000,
            enable_large_batch_splitting: true,
            allowed_batch_sizes: vec![2],
            ..Default::default()
        };
        let resource = BatchResource::for_function(
            SchedulerOptions::default(),
            options,
            Arc::new(FailingExecutor),
            1,
        )
        .unwrap();

        let handle = resource
            .submit("q", vec![MockTensor::counting(5, 1, 0.0)], vec![])
            .unwrap();
        assert_eq!(handle.await, Err(BatchError::internal("executor exploded")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn validation_errors_are_synchronous() {
        let executor = EchoExecutor::new();
        let resource = function_resource(QueueOptions::default(), executor);

        // Rank-0 input.
        let err = resource
            .submit("q", vec![MockTensor::scalar(1.0)], vec![])
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));

        // Mismatched leading dimensions.
        let err = resource
            .submit(
                "q",
                vec![
                    MockTensor::counting(2, 1, 0.0),
                    MockTensor::counting(3, 1, 0.0),
                ],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));

        // No inputs at all.
        let err = resource.submit("q", vec![], vec![]).unwrap_err();
        assert!(matches!(err, BatchError::InvalidArgument(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn captured_inputs_ride_along_unbatched() {
        let executor = EchoExecutor::new();
        let options = QueueOptions {
            max_batch_size: 4,
            batch_timeout_micros: 5_000,
            ..Default::default()
        };
        let resource = function_resource(options, executor.clone());

        let handle = resource
            .submit(
                "q",
                vec![MockTensor::counting(2, 1, 0.0)],
                vec![MockTensor::counting(1, 3, 9.0)],
            )
            .unwrap();
        // Output slot 0 is the batched echo of the concatenated input.
        handle.await.unwrap();

        assert_eq!(
            executor.seen_arg_shapes(),
            vec![vec![vec![2, 1], vec![1, 3]]]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn legacy_mode_emits_index_and_ids() {
        let options = QueueOptions {
            max_batch_size: 8,
            batch_timeout_micros: 60_000_000,
            ..Default::default()
        };
        let resource =
            BatchResource::<MockTensor>::for_batch(SchedulerOptions::default(), options).unwrap();

        let first_context = OpContext::new(1);
        let (first_done, first_rx) = done_channel();
        resource
            .register_input(
                7,
                "q",
                vec![MockTensor::counting(2, 1, 0.0)],
                vec![],
                first_context.clone(),
                first_done,
            )
            .unwrap();

        let second_context = OpContext::new(1);
        let (second_done, second_rx) = done_channel();
        resource
            .register_input(
                8,
                "q",
                vec![MockTensor::counting(6, 1, 10.0)],
                vec![],
                second_context.clone(),
                second_done,
            )
            .unwrap();

        first_rx.await.unwrap();
        second_rx.await.unwrap();

        // The non-last submission gets an empty output and an empty index.
        let first_outputs = first_context.take_outputs().unwrap();
        assert_eq!(first_outputs[0].shape(), vec![0, 1]);
        assert_eq!(first_context.take_index(), Some(vec![]));
        assert_eq!(first_context.take_id(), Some(7));

        // The last submission carries the concatenated batch and the index.
        let second_outputs = second_context.take_outputs().unwrap();
        assert_eq!(second_outputs[0].shape(), vec![8, 1]);
        assert_eq!(&second_outputs[0].data()[..2], &[0.0, 1.0]);
        let index = second_context.take_index().unwrap();
        assert_eq!(
            index,
            vec![
                crate::tensor::IndexEntry::new(7, 0, 2),
                crate::tensor::IndexEntry::new(8, 2, 8),
            ]
        );
        assert_eq!(second_context.take_id(), Some(8));
    }
}
