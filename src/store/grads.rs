//! Gradient buffers, one per optimizable attribute.

use super::{check_len, retain_by_mask, StoreError};
use crate::core::{ShCoeffs, SH_COEFFS};
use nalgebra::{Vector3, Vector4};

/// dL/d(attribute) for every primitive.
///
/// Rotation gradients are with respect to the raw quaternion components in
/// nalgebra's coordinate order `(i, j, k, w)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamGrads {
    pub position: Vec<Vector3<f32>>,
    pub rotation: Vec<Vector4<f32>>,
    pub log_scale: Vec<Vector3<f32>>,
    pub opacity: Vec<f32>,
    pub sh: Vec<ShCoeffs>,
}

impl ParamGrads {
    pub fn zeros(len: usize) -> Self {
        Self {
            position: vec![Vector3::zeros(); len],
            rotation: vec![Vector4::zeros(); len],
            log_scale: vec![Vector3::zeros(); len],
            opacity: vec![0.0; len],
            sh: vec![[[0.0; 3]; SH_COEFFS]; len],
        }
    }

    /// Row count, taken from the position buffer.
    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    /// Every buffer must have `expected` rows.
    pub fn check_rows(&self, expected: usize) -> Result<(), StoreError> {
        check_len("grad.position", self.position.len(), expected)?;
        check_len("grad.rotation", self.rotation.len(), expected)?;
        check_len("grad.log_scale", self.log_scale.len(), expected)?;
        check_len("grad.opacity", self.opacity.len(), expected)?;
        check_len("grad.sh", self.sh.len(), expected)
    }

    /// Element-wise `self += other`. Both sides must already be row-aligned.
    pub(crate) fn add_assign(&mut self, other: &ParamGrads) {
        for (a, b) in self.position.iter_mut().zip(&other.position) {
            *a += b;
        }
        for (a, b) in self.rotation.iter_mut().zip(&other.rotation) {
            *a += b;
        }
        for (a, b) in self.log_scale.iter_mut().zip(&other.log_scale) {
            *a += b;
        }
        for (a, b) in self.opacity.iter_mut().zip(&other.opacity) {
            *a += b;
        }
        for (a, b) in self.sh.iter_mut().zip(&other.sh) {
            for (ca, cb) in a.iter_mut().zip(b) {
                ca[0] += cb[0];
                ca[1] += cb[1];
                ca[2] += cb[2];
            }
        }
    }

    /// Reset all gradients to zero, keeping the row count.
    pub fn clear(&mut self) {
        *self = Self::zeros(self.len());
    }

    /// True when every gradient component is finite.
    pub fn all_finite(&self) -> bool {
        self.position.iter().all(|g| g.iter().all(|x| x.is_finite()))
            && self.rotation.iter().all(|g| g.iter().all(|x| x.is_finite()))
            && self.log_scale.iter().all(|g| g.iter().all(|x| x.is_finite()))
            && self.opacity.iter().all(|x| x.is_finite())
            && self.sh.iter().flatten().flatten().all(|x| x.is_finite())
    }

    pub(crate) fn extend_zeroed(&mut self, additional: usize) {
        let len = self.len() + additional;
        self.position.resize(len, Vector3::zeros());
        self.rotation.resize(len, Vector4::zeros());
        self.log_scale.resize(len, Vector3::zeros());
        self.opacity.resize(len, 0.0);
        self.sh.resize(len, [[0.0; 3]; SH_COEFFS]);
    }

    pub(crate) fn retain(&mut self, keep: &[bool]) {
        retain_by_mask(&mut self.position, keep);
        retain_by_mask(&mut self.rotation, keep);
        retain_by_mask(&mut self.log_scale, keep);
        retain_by_mask(&mut self.opacity, keep);
        retain_by_mask(&mut self.sh, keep);
    }
}
