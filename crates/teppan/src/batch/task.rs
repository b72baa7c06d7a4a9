use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::Span;

use crate::backend::Backend;
use crate::communication::{DoneCallback, IncrementalBarrier, OpContext, SharedStatus};
use crate::error::{BatchError, Result};
use crate::scheduler::{split_task_sizes, SchedulerTask};
use crate::tensor;

/// Split-output matrix shared by the pieces of one submission: one row per
/// piece, one column per executor output. Each piece writes only its own
/// row; the completion barrier takes all rows at once.
#[derive(Debug)]
pub(crate) struct TensorMatrix<B> {
    rows: Mutex<Vec<Vec<Option<B>>>>,
}

impl<B: Backend> TensorMatrix<B> {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }

    fn resize(&self, num_rows: usize, num_cols: usize) {
        let mut rows = self.rows.lock().unwrap();
        *rows = (0..num_rows)
            .map(|_| (0..num_cols).map(|_| None).collect())
            .collect();
    }

    pub fn set(&self, row: usize, col: usize, tensor: B) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(slot) = rows.get_mut(row).and_then(|r| r.get_mut(col)) {
            *slot = Some(tensor);
        }
    }

    fn take_rows(&self) -> Vec<Vec<Option<B>>> {
        std::mem::take(&mut *self.rows.lock().unwrap())
    }
}

/// One task to be batched: a slice of the input from one submission.
///
/// A whole (unsplit) submission is a specialized slice with `is_partial`
/// false and `split_index` 0. Pieces of a split submission share the parent's
/// context, output matrix, status cell and, through the barrier, its done
/// callback.
pub struct BatchTask<B: Backend> {
    pub(crate) guid: u64,
    pub(crate) inputs: Vec<B>,
    pub(crate) captured_inputs: Vec<B>,
    pub(crate) context: Arc<OpContext<B>>,
    pub(crate) done: DoneCallback,
    pub(crate) propagated_span: Span,
    pub(crate) start_time: Instant,
    pub(crate) is_partial: bool,
    pub(crate) split_index: usize,
    pub(crate) output: Arc<TensorMatrix<B>>,
    pub(crate) status: Arc<SharedStatus>,
}

impl<B: Backend> BatchTask<B> {
    pub(crate) fn new(
        guid: u64,
        inputs: Vec<B>,
        captured_inputs: Vec<B>,
        context: Arc<OpContext<B>>,
        done: DoneCallback,
    ) -> Self {
        Self {
            guid,
            inputs,
            captured_inputs,
            context,
            done,
            propagated_span: Span::current(),
            start_time: Instant::now(),
            is_partial: false,
            split_index: 0,
            output: Arc::new(TensorMatrix::new()),
            status: Arc::new(SharedStatus::new()),
        }
    }

    /// Splits this task into pieces sized by [`split_task_sizes`].
    ///
    /// Every piece is marked partial and shares the parent's output matrix
    /// and status cell. The parent's done callback moves into a completion
    /// barrier: once all pieces have completed, the barrier concatenates
    /// each output column across the pieces in split order, delivers the
    /// result to the parent's context together with the first error
    /// observed, and fires the callback exactly once.
    pub(crate) fn split_into_pieces(self, first_size: usize, max_size: usize) -> Result<Vec<Self>> {
        let sizes = split_task_sizes(self.size(), first_size, max_size);
        let num_pieces = sizes.len();

        // Split the inputs up front, before the barrier exists, so a split
        // failure leaves the done callback unfired.
        let mut piece_inputs: Vec<Vec<B>> = (0..num_pieces)
            .map(|_| Vec::with_capacity(self.inputs.len()))
            .collect();
        for input in &self.inputs {
            let parts = tensor::split(input, &sizes).map_err(|error| {
                BatchError::internal(format!("splitting an input tensor failed: {error}"))
            })?;
            if parts.len() != num_pieces {
                return Err(BatchError::internal(format!(
                    "tensor split produced {} pieces; expected {}",
                    parts.len(),
                    num_pieces
                )));
            }
            for (piece, part) in piece_inputs.iter_mut().zip(parts) {
                piece.push(part);
            }
        }

        let Self {
            guid,
            captured_inputs,
            context,
            done,
            start_time,
            output,
            status,
            ..
        } = self;

        output.resize(num_pieces, context.num_outputs());

        let merge_output = output.clone();
        let merge_context = context.clone();
        let merge_status = status.clone();
        let merge = move || {
            let mut rows = merge_output.take_rows();
            if merge_status.is_ok() {
                'columns: for col in 0..merge_context.num_outputs() {
                    let mut parts = Vec::with_capacity(rows.len());
                    for row in rows.iter_mut() {
                        match row.get_mut(col).and_then(Option::take) {
                            Some(part) => parts.push(part),
                            None => {
                                merge_status.update(Err(BatchError::internal(
                                    "bad bookkeeping of split outputs",
                                )));
                                break 'columns;
                            }
                        }
                    }
                    match tensor::concat(&parts) {
                        Ok(merged) => merge_context.set_output(col, merged),
                        Err(error) => {
                            merge_status.update(Err(error));
                            break 'columns;
                        }
                    }
                }
            }
            merge_context.set_status(merge_status.result());
            done();
        };
        let barrier = IncrementalBarrier::new(merge);

        let pieces = piece_inputs
            .into_iter()
            .enumerate()
            .map(|(split_index, inputs)| Self {
                guid,
                inputs,
                captured_inputs: captured_inputs.clone(),
                context: context.clone(),
                done: barrier.inc(),
                propagated_span: Span::current(),
                start_time,
                is_partial: true,
                split_index,
                output: output.clone(),
                status: status.clone(),
            })
            .collect();

        // Dropping the barrier commits the count; from here on the merge
        // callback fires as soon as the last piece completes.
        Ok(pieces)
    }
}

impl<B: Backend> SchedulerTask for BatchTask<B> {
    fn size(&self) -> usize {
        self.inputs.first().map(|t| t.num_rows()).unwrap_or(0)
    }
}
