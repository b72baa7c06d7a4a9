//! Leading-dimension tensor shaping.
//!
//! Thin, validating wrappers over the [`Backend`] concat and slice
//! primitives, plus the index-entry type that ties a region of a
//! concatenated tensor back to the submission that produced it.

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{BatchError, Result};

/// One row of the index emitted in legacy batch mode: the originating
/// submission's batch key and the half-open row range `start..end` it owns
/// inside the concatenated tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: u64,
    pub start: usize,
    pub end: usize,
}

impl IndexEntry {
    pub fn new(key: u64, start: usize, end: usize) -> Self {
        Self { key, start, end }
    }

    /// Number of rows this entry covers.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Concatenates `inputs` into a single tensor along the leading dimension.
///
/// All inputs must have the same rank and identical non-leading dimensions.
pub fn concat<B: Backend>(inputs: &[B]) -> Result<B> {
    if inputs.is_empty() {
        return Err(BatchError::invalid_argument(
            "cannot concatenate an empty list of tensors",
        ));
    }
    let first_shape = inputs[0].shape();
    if first_shape.is_empty() {
        return Err(BatchError::invalid_argument(
            "concatenated tensors must have at least one dimension",
        ));
    }
    for (i, input) in inputs.iter().enumerate().skip(1) {
        let shape = input.shape();
        if shape.len() != first_shape.len() {
            return Err(BatchError::invalid_argument(format!(
                "ranks of all input tensors should match: shape[0] = {:?} vs. shape[{}] = {:?}",
                first_shape, i, shape
            )));
        }
        if shape[1..] != first_shape[1..] {
            return Err(BatchError::invalid_argument(format!(
                "dimensions of inputs should match: shape[0] = {:?} vs. shape[{}] = {:?}",
                first_shape, i, shape
            )));
        }
    }
    Ok(B::cat(inputs))
}

/// Splits `input` along the leading dimension into `sizes.len()` tensors,
/// with the i-th split having leading-dimension size `sizes[i]`.
pub fn split<B: Backend>(input: &B, sizes: &[usize]) -> Result<Vec<B>> {
    let num_rows = input.num_rows();
    let total: usize = sizes.iter().sum();
    if total > num_rows {
        return Err(BatchError::invalid_argument(
            "sum of split sizes must not exceed the leading dimension of the input tensor",
        ));
    }

    // Trivial 1-way split.
    if sizes.len() == 1 && sizes[0] == num_rows {
        return Ok(vec![input.clone()]);
    }

    let mut outputs = Vec::with_capacity(sizes.len());
    let mut position = 0;
    for &size in sizes {
        outputs.push(input.slice(position, position + size));
        position += size;
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockTensor;

    #[test]
    fn concat_then_split_round_trips() {
        let a = MockTensor::counting(3, 2, 0.0);
        let b = MockTensor::counting(5, 2, 10.0);
        let joined = concat(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(joined.shape(), vec![8, 2]);

        let parts = split(&joined, &[3, 5]).unwrap();
        assert_eq!(parts[0], a);
        assert_eq!(parts[1], b);
    }

    #[test]
    fn concat_rejects_rank_mismatch() {
        let a = MockTensor::counting(2, 2, 0.0);
        let b = MockTensor::new(vec![2], vec![0.0, 1.0]);
        assert!(matches!(
            concat(&[a, b]),
            Err(BatchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn concat_rejects_trailing_dim_mismatch() {
        let a = MockTensor::counting(2, 2, 0.0);
        let b = MockTensor::counting(2, 3, 0.0);
        assert!(matches!(
            concat(&[a, b]),
            Err(BatchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn split_rejects_oversized_request() {
        let t = MockTensor::counting(4, 1, 0.0);
        assert!(matches!(
            split(&t, &[3, 3]),
            Err(BatchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn split_may_leave_a_remainder() {
        let t = MockTensor::counting(4, 1, 0.0);
        let parts = split(&t, &[1, 2]).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].data(), &[0.0]);
        assert_eq!(parts[1].data(), &[1.0, 2.0]);
    }

    #[test]
    fn index_entry_length() {
        let entry = IndexEntry::new(7, 2, 6);
        assert_eq!(entry.len(), 4);
        assert!(!entry.is_empty());
    }
}
