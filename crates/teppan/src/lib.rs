//! # Request Batching Engine
//!
//! A library for coalescing many small, concurrent requests into a single
//! larger invocation of an expensive compute function, then redistributing
//! the outputs back to each original caller.
//!
//! ## Overview
//!
//! Inference servers see a stream of small requests, each carrying a group
//! of homogeneously-shaped tensors. Running the compute function once per
//! request wastes hardware; this library batches the requests along their
//! tensors' leading dimension, runs the function once per batch, and slices
//! the results apart again so that every caller observes an ordinary
//! request/response interaction.
//!
//! ## Architecture
//!
//! The library is built around a few key abstractions:
//!
//! ### Backend trait
//!
//! The [`backend::Backend`] trait defines the small tensor interface the
//! core needs: shape inspection plus leading-dimension concat and slice.
//! This keeps the batching logic independent of the tensor implementation;
//! adapter crates implement the trait for concrete tensor libraries.
//!
//! ### Scheduler
//!
//! The [`scheduler::BatchScheduler`] owns a fixed pool of workers shared
//! across named queues. Each queue groups incoming tasks into batches under
//! its size, timeout and backlog policies, optionally splitting oversized
//! tasks across several batches. Workers stay busy for the full duration of
//! one batch, which bounds concurrent executor invocations and gives
//! upstream batches time to coalesce.
//!
//! ### Batch resource
//!
//! The [`batch::BatchResource`] is the caller-facing surface: it validates
//! and schedules submissions, pads closed batches up to an allowed size,
//! concatenates inputs, invokes the [`batch::Executor`], and fans the
//! outputs back out. Every submission's completion callback fires exactly
//! once, whether the batch succeeded or failed.
//!
//! ### Unbatch rendezvous
//!
//! [`unbatch::UnbatchResource`] and [`unbatch::UnbatchGradResource`] pair
//! late-arriving per-key tensors with the callers waiting for them,
//! enforcing deadlines, and reassemble per-key gradients into the order the
//! original batch was formed in.

pub mod backend;
pub mod batch;
pub mod communication;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod tensor;
pub mod unbatch;

pub use backend::Backend;
pub use batch::{BatchResource, BatchTask, Executor};
pub use communication::{done_channel, DoneCallback, OpContext, OutputHandle};
pub use config::{QueueOptions, SchedulerOptions};
pub use error::{BatchError, Result};
pub use scheduler::{Batch, BatchProcessor, BatchScheduler, QueueHandle, SchedulerTask};
pub use tensor::IndexEntry;
pub use unbatch::{UnbatchGradResource, UnbatchResource};
