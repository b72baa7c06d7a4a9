use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::DoneCallback;

/// A counting latch that fires a closure exactly once when every registered
/// increment has been released.
///
/// The barrier itself holds one increment from construction until it is
/// dropped, so the closure can never fire while the producer is still handing
/// out increments. Typical use: create the barrier, call [`inc`] once per
/// piece of work, hand each returned callback to its piece, then drop the
/// barrier to commit the count.
///
/// [`inc`]: IncrementalBarrier::inc
pub struct IncrementalBarrier {
    core: Arc<BarrierCore>,
}

struct BarrierCore {
    left: AtomicUsize,
    on_done: Mutex<Option<DoneCallback>>,
}

impl BarrierCore {
    fn decrement(&self) {
        if self.left.fetch_sub(1, Ordering::AcqRel) == 1 {
            let callback = self.on_done.lock().unwrap().take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

impl IncrementalBarrier {
    pub fn new(on_done: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            core: Arc::new(BarrierCore {
                // The producer's own hold, released on drop.
                left: AtomicUsize::new(1),
                on_done: Mutex::new(Some(Box::new(on_done))),
            }),
        }
    }

    /// Registers one increment and returns the callback that releases it.
    pub fn inc(&self) -> DoneCallback {
        self.core.left.fetch_add(1, Ordering::AcqRel);
        let core = self.core.clone();
        Box::new(move || core.decrement())
    }
}

impl Drop for IncrementalBarrier {
    fn drop(&mut self) {
        self.core.decrement();
    }
}
