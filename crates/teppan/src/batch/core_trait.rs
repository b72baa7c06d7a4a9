use async_trait::async_trait;

use crate::backend::Backend;
use crate::error::Result;

/// The batched compute function.
///
/// `args` is the concatenated (and possibly padded) input tensors followed
/// by the captured inputs of the last task in the batch. The returned
/// tensors must all have a leading dimension equal to the padded batch size.
///
/// A scheduler worker awaits `run` for the whole batch, so the number of
/// concurrent invocations is bounded by the worker-pool size.
#[async_trait]
pub trait Executor<B: Backend>: Send + Sync + 'static {
    async fn run(&self, args: Vec<B>) -> Result<Vec<B>>;
}
