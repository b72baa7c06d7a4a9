use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, trace, Instrument, Span};

use crate::backend::Backend;
use crate::error::{BatchError, Result};
use crate::scheduler::{Batch, BatchProcessor, SchedulerTask};
use crate::tensor::{self, IndexEntry};

use super::core_trait::Executor;
use super::task::BatchTask;

/// Consumes closed batches for a [`super::BatchResource`]: pads and
/// concatenates inputs, invokes the executor (function mode) or re-emits
/// the concatenated inputs with an index (legacy batch mode), fans the
/// outputs back out and fires every task's done callback exactly once.
pub(crate) struct BatchDispatcher<B: Backend> {
    executor: Option<Arc<dyn Executor<B>>>,
    allowed_batch_sizes: Vec<usize>,
}

impl<B: Backend> BatchDispatcher<B> {
    pub fn new(executor: Option<Arc<dyn Executor<B>>>, allowed_batch_sizes: Vec<usize>) -> Self {
        Self {
            executor,
            allowed_batch_sizes,
        }
    }

    /// The smallest allowed batch size that fits `batch_size`, or
    /// `batch_size` itself when no allowed sizes are configured. A batch
    /// larger than the largest allowed size passes through unpadded, with
    /// an error logged.
    fn round_to_lowest_allowed_batch_size(&self, batch_size: usize) -> usize {
        if self.allowed_batch_sizes.is_empty() {
            return batch_size;
        }
        for &allowed in &self.allowed_batch_sizes {
            if allowed >= batch_size {
                return allowed;
            }
        }
        error!(
            batch_size,
            "batch size greater than largest allowed size; ignoring allowed sizes constraint"
        );
        batch_size
    }

    /// Concatenates each input position across tasks, in task order, padding
    /// the batch up to the nearest allowed size with copies of the first
    /// task's first row. Returns the concatenated tensors and the padding
    /// row count.
    fn concat_input_tensors(&self, batch: &Batch<BatchTask<B>>) -> Result<(Vec<B>, usize)> {
        let tasks = batch.tasks();
        if tasks.is_empty() {
            return Err(BatchError::invalid_argument("empty batch"));
        }

        let batch_size = batch.size();
        let padded_size = self.round_to_lowest_allowed_batch_size(batch_size);
        let padding = padded_size - batch_size;
        debug!(batch_size, padded_size, padding, "forming execution batch");

        let num_inputs = tasks[0].inputs.len();
        let mut concatenated = Vec::with_capacity(num_inputs);
        for i in 0..num_inputs {
            let mut to_concatenate: Vec<B> =
                tasks.iter().map(|task| task.inputs[i].clone()).collect();
            if padding > 0 {
                let source = &tasks[0].inputs[i];
                let source_rows = source.num_rows();
                if source_rows == 0 {
                    return Err(BatchError::InvalidArgument(format!(
                        "cannot use an empty tensor with zero rows as padding when batching \
                         (input {i} got shape {:?})",
                        source.shape()
                    )));
                }
                let pad_row = if source_rows == 1 {
                    source.clone()
                } else {
                    source.slice(0, 1)
                };
                to_concatenate.extend(std::iter::repeat(pad_row).take(padding));
            }
            concatenated.push(tensor::concat(&to_concatenate)?);
        }
        Ok((concatenated, padding))
    }

    /// Splits each executor output by the task sizes (plus the padding
    /// suffix, which is discarded) and delivers the slices: into the shared
    /// output matrix for split pieces, onto the context for whole tasks.
    fn split_output_tensors(
        &self,
        outputs: Vec<B>,
        batch: &Batch<BatchTask<B>>,
        padding: usize,
    ) -> Result<()> {
        let tasks = batch.tasks();
        let Some(last) = tasks.last() else {
            return Err(BatchError::internal("batch size expected to be positive"));
        };
        if outputs.len() != last.context.num_outputs() {
            return Err(BatchError::internal(format!(
                "wrong number of batched output tensors: got {}, expected {}",
                outputs.len(),
                last.context.num_outputs()
            )));
        }

        let mut sizes: Vec<usize> = tasks.iter().map(|task| task.size()).collect();
        if padding > 0 {
            sizes.push(padding);
        }
        let total: usize = batch.size() + padding;

        for (col, output) in outputs.into_iter().enumerate() {
            let shape = output.shape();
            if shape.is_empty() {
                return Err(BatchError::FailedPrecondition(
                    "batched output tensor has 0 dimensions".into(),
                ));
            }
            if shape[0] != total {
                return Err(BatchError::FailedPrecondition(format!(
                    "batched output tensor's leading dimension {} does not equal the sum of \
                     the task sizes {}",
                    shape[0], total
                )));
            }

            let mut parts = tensor::split(&output, &sizes)
                .map_err(|error| BatchError::internal(format!("tensor split failed: {error}")))?;
            if parts.len() != sizes.len() {
                return Err(BatchError::internal(format!(
                    "tensor split produced {} pieces; expected {}",
                    parts.len(),
                    sizes.len()
                )));
            }
            // Drop the padding suffix.
            parts.truncate(tasks.len());

            for (task, part) in tasks.iter().zip(parts) {
                if task.is_partial {
                    task.output.set(task.split_index, col, part);
                } else {
                    task.context.set_output(col, part);
                }
            }
        }
        Ok(())
    }

    async fn run_func_batch(
        &self,
        batch: &Batch<BatchTask<B>>,
        executor: &Arc<dyn Executor<B>>,
    ) -> Result<()> {
        validate_batch(batch)?;
        let (concatenated, padding) = self.concat_input_tensors(batch)?;

        let mut args = concatenated;
        if let Some(last) = batch.tasks().last() {
            args.extend(last.captured_inputs.iter().cloned());
        }

        let now = Instant::now();
        for task in batch.tasks() {
            trace!(
                delay_micros = now.duration_since(task.start_time).as_micros() as u64,
                "task leaves the batching queue"
            );
        }

        let outputs = executor.run(args).await?;
        self.split_output_tensors(outputs, batch, padding)
    }

    /// Legacy batch mode: emits the concatenated inputs and the populated
    /// index on the last task's context, empty outputs and an empty index on
    /// every other task, and the per-task guid on each task's id slot.
    fn emit_legacy_outputs(&self, batch: &Batch<BatchTask<B>>) -> Result<()> {
        validate_batch(batch)?;
        let (concatenated, _padding) = self.concat_input_tensors(batch)?;

        let tasks = batch.tasks();
        let Some((last, rest)) = tasks.split_last() else {
            return Err(BatchError::internal("batch size expected to be positive"));
        };
        for (i, tensor) in concatenated.into_iter().enumerate() {
            for task in rest {
                task.context.set_output(i, task.inputs[i].slice(0, 0));
            }
            last.context.set_output(i, tensor);
        }
        for task in rest {
            task.context.set_index(Vec::new());
        }
        last.context.set_index(index_entries(batch));
        for task in tasks {
            task.context.set_id(task.guid);
        }
        Ok(())
    }
}

#[async_trait]
impl<B: Backend> BatchProcessor<BatchTask<B>> for BatchDispatcher<B> {
    async fn process_batch(&self, batch: Batch<BatchTask<B>>) {
        if batch.is_empty() {
            return;
        }
        // Run under the propagated span of one of the submitters, so
        // caller-side tracing context stays active across the executor call.
        let span = batch
            .tasks()
            .last()
            .map(|task| task.propagated_span.clone())
            .unwrap_or_else(Span::none);

        let status = match &self.executor {
            Some(executor) => {
                self.run_func_batch(&batch, executor)
                    .instrument(span)
                    .await
            }
            None => span.in_scope(|| self.emit_legacy_outputs(&batch)),
        };
        finish_tasks(batch, status);
    }
}

/// Propagates `status` to every task and fires its done callback. Split
/// pieces record into the shared first-error cell; whole tasks get the
/// status directly on their context.
fn finish_tasks<B: Backend>(batch: Batch<BatchTask<B>>, status: Result<()>) {
    for task in batch.into_tasks() {
        if task.is_partial {
            task.status.update(status.clone());
        } else {
            task.context.set_status(status.clone());
        }
        (task.done)();
    }
}

/// All tasks in a batch must carry the same number of inputs.
fn validate_batch<B: Backend>(batch: &Batch<BatchTask<B>>) -> Result<()> {
    let tasks = batch.tasks();
    let Some(first) = tasks.first() else {
        return Ok(());
    };
    for task in tasks {
        if task.inputs.len() != first.inputs.len() {
            return Err(BatchError::invalid_argument(
                "batching inputs must have an equal number of edges",
            ));
        }
    }
    Ok(())
}

/// One index row per task: its batch key and the row range it owns in the
/// concatenated tensor. Padding rows are not described by any entry.
fn index_entries<B: Backend>(batch: &Batch<BatchTask<B>>) -> Vec<IndexEntry> {
    let mut offset = 0;
    batch
        .tasks()
        .iter()
        .map(|task| {
            let entry = IndexEntry::new(task.guid, offset, offset + task.size());
            offset += task.size();
            entry
        })
        .collect()
}
