//! Per-primitive view-space gradient statistics used to rank densification
//! candidates.

use super::{check_len, retain_by_mask, StoreError};
use serde::{Deserialize, Serialize};

/// Running sum of view-space gradient norms and the number of renders each
/// primitive was visible in.
///
/// Statistics are single-use: the density controller resets them right after
/// a control pass consumes them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GradientAccumulator {
    grad_norm_sum: Vec<f32>,
    observations: Vec<u32>,
}

impl GradientAccumulator {
    /// Zeroed statistics for `len` primitives.
    pub fn new(len: usize) -> Self {
        Self {
            grad_norm_sum: vec![0.0; len],
            observations: vec![0; len],
        }
    }

    pub(crate) fn from_parts(grad_norm_sum: Vec<f32>, observations: Vec<u32>) -> Result<Self, StoreError> {
        check_len("observation_count", observations.len(), grad_norm_sum.len())?;
        Ok(Self {
            grad_norm_sum,
            observations,
        })
    }

    pub fn len(&self) -> usize {
        self.grad_norm_sum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grad_norm_sum.is_empty()
    }

    /// Add the gradient norm of every visible primitive and count the view.
    ///
    /// Invisible primitives are untouched; there is no decay.
    pub fn observe(&mut self, visibility: &[bool], gradient_norms: &[f32]) -> Result<(), StoreError> {
        self.check_mask(visibility.len())?;
        self.check_mask(gradient_norms.len())?;

        for (i, _) in visibility.iter().enumerate().filter(|(_, v)| **v) {
            self.grad_norm_sum[i] += gradient_norms[i];
            self.observations[i] += 1;
        }
        Ok(())
    }

    /// Same update as [`observe`](Self::observe) for an explicit list of
    /// visible indices, with `gradient_norms[k]` belonging to `indices[k]`.
    pub fn observe_indices(&mut self, indices: &[usize], gradient_norms: &[f32]) -> Result<(), StoreError> {
        check_len("gradient_norms", gradient_norms.len(), indices.len())?;
        let len = self.len();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(StoreError::IndexOutOfRange { index, len });
        }

        for (&i, &g) in indices.iter().zip(gradient_norms) {
            self.grad_norm_sum[i] += g;
            self.observations[i] += 1;
        }
        Ok(())
    }

    /// `accumulated / max(count, 1)` per primitive. Unobserved primitives report 0.
    pub fn mean_gradient(&self) -> Vec<f32> {
        self.grad_norm_sum
            .iter()
            .zip(&self.observations)
            .map(|(sum, &count)| sum / count.max(1) as f32)
            .collect()
    }

    pub fn is_observed(&self, index: usize) -> bool {
        self.observations.get(index).is_some_and(|&c| c > 0)
    }

    pub fn observation_counts(&self) -> &[u32] {
        &self.observations
    }

    pub fn accumulated(&self) -> &[f32] {
        &self.grad_norm_sum
    }

    /// Zero every entry, keeping the length.
    pub fn reset(&mut self) {
        self.grad_norm_sum.iter_mut().for_each(|g| *g = 0.0);
        self.observations.iter_mut().for_each(|c| *c = 0);
    }

    pub(crate) fn extend_zeroed(&mut self, additional: usize) {
        self.grad_norm_sum.resize(self.grad_norm_sum.len() + additional, 0.0);
        self.observations.resize(self.observations.len() + additional, 0);
    }

    pub(crate) fn retain(&mut self, keep: &[bool]) {
        retain_by_mask(&mut self.grad_norm_sum, keep);
        retain_by_mask(&mut self.observations, keep);
    }

    pub(crate) fn check_rows(&self, expected: usize) -> Result<(), StoreError> {
        check_len("grad_norm_sum", self.grad_norm_sum.len(), expected)?;
        check_len("observation_count", self.observations.len(), expected)
    }

    fn check_mask(&self, actual: usize) -> Result<(), StoreError> {
        if actual == self.len() {
            Ok(())
        } else {
            Err(StoreError::MaskLength {
                expected: self.len(),
                actual,
            })
        }
    }
}
