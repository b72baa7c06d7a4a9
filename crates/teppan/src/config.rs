//! Configuration for the scheduler and its queues.

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// Options for the shared batch scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Number of worker tasks shared across all queues. Each worker stays
    /// busy for the whole duration of one batch, which bounds the number of
    /// concurrent executor invocations.
    pub num_batch_threads: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            num_batch_threads: 4,
        }
    }
}

/// Per-queue batching policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Maximum leading-dimension sum per batch when splitting is off. Also
    /// the admission limit for a single task when splitting is off.
    pub max_batch_size: usize,

    /// Maximum wait from a batch's first task until the batch is closed.
    pub batch_timeout_micros: u64,

    /// Cap on the per-queue backlog (closed batches plus a non-empty open
    /// batch). `schedule` fails with resource-exhausted when exceeded.
    pub max_enqueued_batches: usize,

    /// Split tasks larger than the open batch's remaining slot across
    /// multiple batches instead of rejecting them.
    pub enable_large_batch_splitting: bool,

    /// Maximum leading-dimension sum per batch when splitting is on.
    /// Defaults to the largest allowed batch size, or `max_batch_size` when
    /// no allowed sizes are configured.
    pub max_execution_batch_size: Option<usize>,

    /// Sorted ascending set of acceptable execution sizes. Batches are
    /// padded up to the smallest entry that fits the actual size.
    pub allowed_batch_sizes: Vec<usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            batch_timeout_micros: 1_000,
            max_enqueued_batches: 10,
            enable_large_batch_splitting: false,
            max_execution_batch_size: None,
            allowed_batch_sizes: Vec::new(),
        }
    }
}

impl QueueOptions {
    /// The leading-dimension capacity of a single execution batch.
    pub fn execution_batch_size_limit(&self) -> usize {
        if !self.enable_large_batch_splitting {
            return self.max_batch_size;
        }
        self.max_execution_batch_size.unwrap_or_else(|| {
            self.allowed_batch_sizes
                .last()
                .copied()
                .unwrap_or(self.max_batch_size)
        })
    }

    /// Validates the option set.
    ///
    /// `allowed_batch_sizes` entries must increase strictly monotonically,
    /// and the final entry must equal `max_batch_size` when splitting is
    /// disabled.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(BatchError::invalid_argument(
                "max_batch_size must be positive",
            ));
        }
        if self.allowed_batch_sizes.is_empty() {
            return Ok(());
        }
        let mut last_size = 0;
        for (i, &size) in self.allowed_batch_sizes.iter().enumerate() {
            if i > 0 && size <= last_size {
                return Err(BatchError::invalid_argument(
                    "allowed_batch_sizes entries must be monotonically increasing",
                ));
            }
            if !self.enable_large_batch_splitting
                && i == self.allowed_batch_sizes.len() - 1
                && size != self.max_batch_size
            {
                return Err(BatchError::invalid_argument(
                    "final entry in allowed_batch_sizes must equal max_batch_size when \
                     large batch splitting is disabled",
                ));
            }
            last_size = size;
        }
        Ok(())
    }
}
