//! # Completion plumbing
//!
//! Everything that carries results and completion signals between the
//! batching core and its callers: the one-shot done callback, the
//! first-error status cell shared across split pieces, the incremental
//! barrier that reassembles a split submission, and the context object that
//! outputs are delivered into.

mod barrier;
mod context;
mod status;

/// One-shot completion signal attached to every task. Must fire exactly
/// once; never invoked while an internal lock is held.
pub type DoneCallback = Box<dyn FnOnce() + Send + Sync + 'static>;

pub use barrier::IncrementalBarrier;
pub use context::{done_channel, OpContext, OutputHandle};
pub use status::SharedStatus;
