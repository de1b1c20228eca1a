//! Adam moment rows, owned by the store and resized with it.

use super::{check_len, retain_by_mask, StoreError};
use crate::core::ShCoeffs;
use crate::optim::adam::AdamElement;
use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// First (`m`) and second (`v`) moment estimates, one row per primitive.
///
/// New rows always start at zero: a cloned or split primitive never inherits
/// its parent's momentum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Moments<T> {
    m: Vec<T>,
    v: Vec<T>,
}

impl<T: AdamElement> Moments<T> {
    pub fn zeros(len: usize) -> Self {
        Self {
            m: vec![T::zero(); len],
            v: vec![T::zero(); len],
        }
    }

    pub(crate) fn from_parts(name: &'static str, m: Vec<T>, v: Vec<T>) -> Result<Self, StoreError> {
        check_len(name, v.len(), m.len())?;
        Ok(Self { m, v })
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    /// First moment estimates.
    pub fn first(&self) -> &[T] {
        &self.m
    }

    /// Second moment estimates.
    pub fn second(&self) -> &[T] {
        &self.v
    }

    pub(crate) fn rows_mut(&mut self) -> (&mut [T], &mut [T]) {
        (&mut self.m, &mut self.v)
    }

    /// Zero every row; used when an attribute is overwritten wholesale.
    pub(crate) fn reset(&mut self) {
        self.m.iter_mut().for_each(|x| *x = T::zero());
        self.v.iter_mut().for_each(|x| *x = T::zero());
    }

    pub(crate) fn extend_zeroed(&mut self, additional: usize) {
        let len = self.m.len() + additional;
        self.m.resize(len, T::zero());
        self.v.resize(len, T::zero());
    }

    pub(crate) fn retain(&mut self, keep: &[bool]) {
        retain_by_mask(&mut self.m, keep);
        retain_by_mask(&mut self.v, keep);
    }

    fn check_rows(&self, name: &'static str, expected: usize) -> Result<(), StoreError> {
        check_len(name, self.m.len(), expected)?;
        check_len(name, self.v.len(), expected)
    }
}

/// Moments for every optimizable attribute group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamMoments {
    pub position: Moments<Vector3<f32>>,
    pub rotation: Moments<Vector4<f32>>,
    pub log_scale: Moments<Vector3<f32>>,
    pub opacity: Moments<f32>,
    pub sh: Moments<ShCoeffs>,
}

impl ParamMoments {
    pub fn zeros(len: usize) -> Self {
        Self {
            position: Moments::zeros(len),
            rotation: Moments::zeros(len),
            log_scale: Moments::zeros(len),
            opacity: Moments::zeros(len),
            sh: Moments::zeros(len),
        }
    }

    pub fn check_rows(&self, expected: usize) -> Result<(), StoreError> {
        self.position.check_rows("moments.position", expected)?;
        self.rotation.check_rows("moments.rotation", expected)?;
        self.log_scale.check_rows("moments.log_scale", expected)?;
        self.opacity.check_rows("moments.opacity", expected)?;
        self.sh.check_rows("moments.sh", expected)
    }

    pub(crate) fn extend_zeroed(&mut self, additional: usize) {
        self.position.extend_zeroed(additional);
        self.rotation.extend_zeroed(additional);
        self.log_scale.extend_zeroed(additional);
        self.opacity.extend_zeroed(additional);
        self.sh.extend_zeroed(additional);
    }

    pub(crate) fn retain(&mut self, keep: &[bool]) {
        self.position.retain(keep);
        self.rotation.retain(keep);
        self.log_scale.retain(keep);
        self.opacity.retain(keep);
        self.sh.retain(keep);
    }
}

impl Default for ParamMoments {
    fn default() -> Self {
        ParamMoments::zeros(0)
    }
}
