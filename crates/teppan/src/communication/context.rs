use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::backend::Backend;
use crate::error::{BatchError, Result};
use crate::tensor::IndexEntry;

use super::DoneCallback;

/// The delivery target for one submission.
///
/// An `OpContext` is created with a fixed number of output slots (the arity
/// of the batched function). The batching core fills the slots and the final
/// status, then fires the submission's done callback; the caller reads the
/// results afterwards. In legacy batch mode the typed `index` and `id` slots
/// are populated as well.
///
/// All slots are internally locked; the core only ever writes from one
/// thread at a time per submission, but delivery and readout may race with
/// deadline eviction.
#[derive(Debug)]
pub struct OpContext<B: Backend> {
    outputs: Mutex<Vec<Option<B>>>,
    index: Mutex<Option<Vec<IndexEntry>>>,
    id: Mutex<Option<u64>>,
    status: Mutex<Result<()>>,
}

impl<B: Backend> OpContext<B> {
    pub fn new(num_outputs: usize) -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new((0..num_outputs).map(|_| None).collect()),
            index: Mutex::new(None),
            id: Mutex::new(None),
            status: Mutex::new(Ok(())),
        })
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.lock().unwrap().len()
    }

    /// Stores `tensor` in output slot `i`. Out-of-range writes are ignored;
    /// the processing pipeline checks arity before delivering.
    pub fn set_output(&self, i: usize, tensor: B) {
        let mut outputs = self.outputs.lock().unwrap();
        if let Some(slot) = outputs.get_mut(i) {
            *slot = Some(tensor);
        }
    }

    pub fn set_index(&self, entries: Vec<IndexEntry>) {
        *self.index.lock().unwrap() = Some(entries);
    }

    pub fn set_id(&self, id: u64) {
        *self.id.lock().unwrap() = Some(id);
    }

    /// Sets the final status of the submission, overwriting any previous one.
    pub fn set_status(&self, status: Result<()>) {
        *self.status.lock().unwrap() = status;
    }

    /// Marks the submission failed.
    pub fn fail(&self, error: BatchError) {
        self.set_status(Err(error));
    }

    pub fn status(&self) -> Result<()> {
        self.status.lock().unwrap().clone()
    }

    pub fn take_index(&self) -> Option<Vec<IndexEntry>> {
        self.index.lock().unwrap().take()
    }

    pub fn take_id(&self) -> Option<u64> {
        self.id.lock().unwrap().take()
    }

    /// Takes all delivered outputs, failing with the recorded status if the
    /// submission errored, or with an internal error on an unfilled slot.
    pub fn take_outputs(&self) -> Result<Vec<B>> {
        self.status()?;
        let mut outputs = self.outputs.lock().unwrap();
        outputs
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| {
                slot.take()
                    .ok_or_else(|| BatchError::internal(format!("output slot {i} was never filled")))
            })
            .collect()
    }
}

/// Creates a connected done-callback / completion-signal pair.
///
/// The callback may be fired from any thread; the receiver resolves once it
/// has fired. Dropping the callback without firing it resolves the receiver
/// with an error.
pub fn done_channel() -> (DoneCallback, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let done: DoneCallback = Box::new(move || {
        let _ = tx.send(());
    });
    (done, rx)
}

/// An awaitable handle to a submission's outputs.
///
/// Resolves once the submission's done callback has fired, yielding the
/// delivered outputs or the submission's final status.
#[derive(Debug)]
pub struct OutputHandle<B: Backend> {
    context: Arc<OpContext<B>>,
    receiver: oneshot::Receiver<()>,
}

impl<B: Backend> OutputHandle<B> {
    pub fn new(context: Arc<OpContext<B>>, receiver: oneshot::Receiver<()>) -> Self {
        Self { context, receiver }
    }

    /// The underlying delivery target, for inspecting the index and id slots
    /// of legacy-mode submissions.
    pub fn context(&self) -> Arc<OpContext<B>> {
        self.context.clone()
    }
}

impl<B: Backend> Future for OutputHandle<B> {
    type Output = Result<Vec<B>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => Poll::Ready(this.context.take_outputs()),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BatchError::internal(
                "completion signal dropped before firing",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockTensor;

    #[test]
    fn outputs_round_trip_through_slots() {
        let context = OpContext::<MockTensor>::new(2);
        context.set_output(1, MockTensor::counting(1, 2, 5.0));
        context.set_output(0, MockTensor::counting(2, 2, 0.0));

        let outputs = context.take_outputs().unwrap();
        assert_eq!(outputs[0].shape(), vec![2, 2]);
        assert_eq!(outputs[1].shape(), vec![1, 2]);
    }

    #[test]
    fn error_status_wins_over_outputs() {
        let context = OpContext::<MockTensor>::new(1);
        context.set_output(0, MockTensor::counting(1, 1, 0.0));
        context.fail(BatchError::internal("boom"));
        assert_eq!(
            context.take_outputs(),
            Err(BatchError::internal("boom"))
        );
    }

    #[test]
    fn unfilled_slot_is_an_internal_error() {
        let context = OpContext::<MockTensor>::new(2);
        context.set_output(0, MockTensor::counting(1, 1, 0.0));
        assert!(matches!(
            context.take_outputs(),
            Err(BatchError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn handle_resolves_after_done_fires() {
        let context = OpContext::<MockTensor>::new(1);
        let (done, rx) = done_channel();
        let handle = OutputHandle::new(context.clone(), rx);

        context.set_output(0, MockTensor::counting(3, 1, 1.0));
        done();

        let outputs = handle.await.unwrap();
        assert_eq!(outputs[0].data(), &[1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn dropped_done_surfaces_as_internal_error() {
        let context = OpContext::<MockTensor>::new(1);
        let (done, rx) = done_channel();
        let handle = OutputHandle::new(context, rx);
        drop(done);
        assert!(matches!(handle.await, Err(BatchError::Internal(_))));
    }
}
