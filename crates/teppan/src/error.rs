//! Error types for the batching subsystem.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BatchError>;

/// Main error type for batching, unbatching and scheduling operations.
///
/// Variants mirror the status taxonomy surfaced to callers: validation
/// failures are reported synchronously, while errors discovered after a task
/// has been enqueued travel through the task's context or shared status cell.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Malformed inputs: bad ranks, mismatched shapes, invalid options.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The per-queue backlog is at capacity.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An unbatch waiter timed out before its tensor arrived.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The executor produced outputs that do not match the batch.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A bookkeeping invariant was violated. Should not occur.
    #[error("internal: {0}")]
    Internal(String),

    /// A rendezvous key was used more than once.
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl BatchError {
    /// Build an [`BatchError::InvalidArgument`] from anything displayable.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Build an [`BatchError::Internal`] from anything displayable.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
