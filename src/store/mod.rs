//! Primitive store: the parallel attribute arrays of all live Gaussians,
//! together with everything that must stay row-aligned with them.
//!
//! - `GaussianStore`: attributes, gradient buffers, screen-radius stats,
//!   densification statistics and Adam moments in one owned aggregate
//! - `GradientAccumulator`: per-primitive view-space gradient statistics
//! - `Moments` / `ParamMoments`: per-attribute Adam state rows
//! - `ParamGrads`: per-attribute gradient buffers
//!
//! Only `GaussianStore::append` and `GaussianStore::select_and_compact` change
//! the number of rows, and they touch every aligned array in the same call.
//! Row indices are valid within one `generation()` only.

mod accumulator;
mod grads;
mod moments;
mod primitives;

pub use accumulator::GradientAccumulator;
pub use grads::ParamGrads;
pub use moments::{Moments, ParamMoments};
pub use primitives::{GaussianStore, StoreSnapshot};

use thiserror::Error;

/// Errors raised by store operations.
///
/// `LengthMismatch` means the row-alignment invariant is broken; callers must
/// treat it as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("mask has {actual} entries but the store has {expected} rows")]
    MaskLength { expected: usize, actual: usize },

    #[error("array `{array}` has {actual} rows, expected {expected}")]
    LengthMismatch {
        array: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("index {index} out of range for {len} rows")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Keep the entries of `v` whose mask bit is set, preserving order.
///
/// Callers validate `keep.len() == v.len()` first.
pub(crate) fn retain_by_mask<T>(v: &mut Vec<T>, keep: &[bool]) {
    let mut bits = keep.iter();
    v.retain(|_| bits.next().copied().unwrap_or(false));
}

pub(crate) fn check_len(array: &'static str, actual: usize, expected: usize) -> Result<(), StoreError> {
    if actual == expected {
        Ok(())
    } else {
        Err(StoreError::LengthMismatch {
            array,
            expected,
            actual,
        })
    }
}
