//! # Tensor Backend
//!
//! This module defines the interface the batching core expects from a tensor
//! implementation. The core never touches element data itself; everything it
//! does is expressed through leading-dimension concatenation and slicing.
//!
//! Backend crates (for example the candle adapter) implement [`Backend`] for
//! their tensor type, which lets the batching, padding and unbatching logic
//! stay backend-agnostic.

mod core_trait;

pub use core_trait::*;

#[cfg(test)]
/// Mock tensor implementation carrying real row data, so tests can assert on
/// element values after concat/split round trips.
pub(crate) mod mock;
