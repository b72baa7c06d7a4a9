//! Candle tensor backend for the teppan batching engine.
//!
//! Implements [`teppan::Backend`] for [`candle_core::Tensor`], so batching
//! resources can be instantiated directly over candle tensors:
//!
//! the batching core only ever concatenates and slices along the leading
//! dimension, both of which map one-to-one onto candle's `cat` and `narrow`.

mod tensor;
