//! The Gaussian store: Struct-of-Arrays attributes plus every row-aligned
//! buffer that must follow them through densification and pruning.

use super::{check_len, retain_by_mask, GradientAccumulator, ParamGrads, ParamMoments, StoreError};
use crate::core::{inverse_sigmoid, normalize_rotation, sigmoid, Gaussian, ShCoeffs};
use crate::optim::adam::{adam_step, adam_step_sh, Adam, AdamElement};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// All live Gaussians.
///
/// Invariants (checked by [`check_invariants`](Self::check_invariants)):
/// every attribute array, gradient buffer, screen-radius entry, accumulator
/// entry and Adam moment row has exactly `len()` rows, and row `i` of each
/// belongs to the same primitive.
#[derive(Clone, Debug, Default)]
pub struct GaussianStore {
    positions: Vec<Vector3<f32>>,
    rotations: Vec<Quaternion<f32>>,
    log_scales: Vec<Vector3<f32>>,
    opacity_logits: Vec<f32>,
    sh_coeffs: Vec<ShCoeffs>,

    /// Running max of projected screen radius (pixels) since the last control pass.
    max_screen_radius: Vec<f32>,

    grads: ParamGrads,
    accumulator: GradientAccumulator,
    moments: ParamMoments,

    generation: u64,
}

/// Full copy of a store, used by the checkpoint bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub positions: Vec<Vector3<f32>>,
    pub rotations: Vec<Quaternion<f32>>,
    pub log_scales: Vec<Vector3<f32>>,
    pub opacity_logits: Vec<f32>,
    pub sh_coeffs: Vec<ShCoeffs>,
    pub max_screen_radius: Vec<f32>,
    pub grad_norm_sum: Vec<f32>,
    pub observation_counts: Vec<u32>,
    pub moments: ParamMoments,
}

impl GaussianStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from initial Gaussians. Statistics and moments start at zero.
    pub fn from_gaussians(gaussians: &[Gaussian]) -> Self {
        let mut store = Self::new();
        store.append(gaussians);
        store.generation = 0;
        store
    }

    /// Number of live primitives (N).
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Incremented by every resize that changes rows; indices from an older
    /// generation must not be used.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn positions(&self) -> &[Vector3<f32>] {
        &self.positions
    }

    /// Raw rotations; may be unnormalized between optimizer steps.
    pub fn rotations(&self) -> &[Quaternion<f32>] {
        &self.rotations
    }

    /// Rotation `i` on the unit sphere, as the rasterizer must read it.
    pub fn normalized_rotation(&self, i: usize) -> UnitQuaternion<f32> {
        normalize_rotation(&self.rotations[i])
    }

    pub fn log_scales(&self) -> &[Vector3<f32>] {
        &self.log_scales
    }

    pub fn opacity_logits(&self) -> &[f32] {
        &self.opacity_logits
    }

    pub fn sh_coeffs(&self) -> &[ShCoeffs] {
        &self.sh_coeffs
    }

    pub fn max_screen_radius(&self) -> &[f32] {
        &self.max_screen_radius
    }

    pub fn grads(&self) -> &ParamGrads {
        &self.grads
    }

    pub fn accumulator(&self) -> &GradientAccumulator {
        &self.accumulator
    }

    pub fn moments(&self) -> &ParamMoments {
        &self.moments
    }

    /// Activated opacity of primitive `i`.
    pub fn opacity(&self, i: usize) -> f32 {
        sigmoid(self.opacity_logits[i])
    }

    /// Largest world-space axis extent of primitive `i`.
    pub fn max_scale(&self, i: usize) -> f32 {
        self.log_scales[i].max().exp()
    }

    /// Copy of row `i`.
    pub fn gaussian(&self, i: usize) -> Option<Gaussian> {
        if i >= self.len() {
            return None;
        }
        Some(Gaussian::new(
            self.positions[i],
            self.rotations[i],
            self.log_scales[i],
            self.opacity_logits[i],
            self.sh_coeffs[i],
        ))
    }

    pub fn to_gaussians(&self) -> Vec<Gaussian> {
        (0..self.len()).filter_map(|i| self.gaussian(i)).collect()
    }

    /// Append rows at the end, preserving the order of existing rows.
    ///
    /// New rows get zero gradients, zero statistics and zero Adam moments.
    pub fn append(&mut self, rows: &[Gaussian]) {
        if rows.is_empty() {
            return;
        }
        let additional = rows.len();

        self.positions.reserve(additional);
        self.rotations.reserve(additional);
        self.log_scales.reserve(additional);
        self.opacity_logits.reserve(additional);
        self.sh_coeffs.reserve(additional);
        for g in rows {
            self.positions.push(g.position);
            self.rotations.push(g.rotation);
            self.log_scales.push(g.log_scale);
            self.opacity_logits.push(g.opacity_logit);
            self.sh_coeffs.push(g.sh_coeffs);
        }
        self.max_screen_radius.resize(self.positions.len(), 0.0);

        self.grads.extend_zeroed(additional);
        self.accumulator.extend_zeroed(additional);
        self.moments.extend_zeroed(additional);
        self.generation += 1;
    }

    /// Keep exactly the rows whose mask bit is set, in their original order,
    /// across attributes, gradients, statistics and Adam moments.
    ///
    /// Returns the number of removed rows. A mask of the wrong length is
    /// rejected before anything is modified.
    pub fn select_and_compact(&mut self, keep_mask: &[bool]) -> Result<usize, StoreError> {
        if keep_mask.len() != self.len() {
            return Err(StoreError::MaskLength {
                expected: self.len(),
                actual: keep_mask.len(),
            });
        }
        let removed = keep_mask.iter().filter(|k| !**k).count();
        if removed == 0 {
            return Ok(0);
        }

        retain_by_mask(&mut self.positions, keep_mask);
        retain_by_mask(&mut self.rotations, keep_mask);
        retain_by_mask(&mut self.log_scales, keep_mask);
        retain_by_mask(&mut self.opacity_logits, keep_mask);
        retain_by_mask(&mut self.sh_coeffs, keep_mask);
        retain_by_mask(&mut self.max_screen_radius, keep_mask);
        self.grads.retain(keep_mask);
        self.accumulator.retain(keep_mask);
        self.moments.retain(keep_mask);
        self.generation += 1;

        self.check_invariants()?;
        Ok(removed)
    }

    /// Force every opacity to `value` (activated domain) without changing N.
    ///
    /// Only the opacity moments are cleared.
    pub fn reset_opacity(&mut self, value: f32) {
        let logit = inverse_sigmoid(value);
        self.opacity_logits.iter_mut().for_each(|o| *o = logit);
        self.moments.opacity.reset();
    }

    /// Fold one render's per-primitive signals into the running statistics.
    ///
    /// For visible primitives: max screen radius is updated and the view-space
    /// gradient norm is accumulated.
    pub fn record_render_stats(
        &mut self,
        visibility: &[bool],
        radii: &[f32],
        viewspace_grad_norms: &[f32],
    ) -> Result<(), StoreError> {
        let n = self.len();
        for actual in [visibility.len(), radii.len(), viewspace_grad_norms.len()] {
            if actual != n {
                return Err(StoreError::MaskLength { expected: n, actual });
            }
        }

        for ((max_r, &r), _) in self
            .max_screen_radius
            .iter_mut()
            .zip(radii)
            .zip(visibility)
            .filter(|(_, v)| **v)
        {
            *max_r = max_r.max(r);
        }
        self.accumulator.observe(visibility, viewspace_grad_norms)
    }

    /// Zero the densification statistics after a control pass consumed them.
    pub fn reset_densification_stats(&mut self) {
        self.accumulator.reset();
        self.max_screen_radius.iter_mut().for_each(|r| *r = 0.0);
    }

    /// Add a backward pass's parameter gradients into the gradient buffers.
    pub fn accumulate_grads(&mut self, grads: &ParamGrads) -> Result<(), StoreError> {
        grads.check_rows(self.len())?;
        self.grads.add_assign(grads);
        Ok(())
    }

    /// Clear gradient buffers.
    pub fn zero_grad(&mut self) {
        self.grads.clear();
    }

    /// One Adam step over every attribute group using the current gradients.
    pub fn optimizer_step(&mut self, adam: &mut Adam) -> Result<(), StoreError> {
        self.check_invariants()?;
        adam.advance();
        let lrs = adam.lrs;

        adam_step(
            &mut self.positions,
            &self.grads.position,
            &mut self.moments.position,
            &adam.coefficients(lrs.position),
        );

        let c_rot = adam.coefficients(lrs.rotation);
        let (m, v) = self.moments.rotation.rows_mut();
        for (((q, g), m), v) in self
            .rotations
            .iter_mut()
            .zip(&self.grads.rotation)
            .zip(m)
            .zip(v)
        {
            q.coords.adam_update(g, m, v, &c_rot);
        }

        adam_step(
            &mut self.log_scales,
            &self.grads.log_scale,
            &mut self.moments.log_scale,
            &adam.coefficients(lrs.log_scale),
        );
        adam_step(
            &mut self.opacity_logits,
            &self.grads.opacity,
            &mut self.moments.opacity,
            &adam.coefficients(lrs.opacity),
        );
        adam_step_sh(
            &mut self.sh_coeffs,
            &self.grads.sh,
            &mut self.moments.sh,
            &adam.coefficients(lrs.sh_dc),
            &adam.coefficients(lrs.sh_rest),
        );
        Ok(())
    }

    /// Verify that every row-aligned array has `len()` rows.
    pub fn check_invariants(&self) -> Result<(), StoreError> {
        let n = self.len();
        check_len("rotation", self.rotations.len(), n)?;
        check_len("log_scale", self.log_scales.len(), n)?;
        check_len("opacity_logit", self.opacity_logits.len(), n)?;
        check_len("sh_coeffs", self.sh_coeffs.len(), n)?;
        check_len("max_screen_radius", self.max_screen_radius.len(), n)?;
        self.grads.check_rows(n)?;
        self.accumulator.check_rows(n)?;
        self.moments.check_rows(n)
    }

    /// True when every attribute value is finite.
    pub fn all_finite(&self) -> bool {
        self.positions.iter().all(|p| p.iter().all(|x| x.is_finite()))
            && self.rotations.iter().all(|q| q.coords.iter().all(|x| x.is_finite()))
            && self.log_scales.iter().all(|s| s.iter().all(|x| x.is_finite()))
            && self.opacity_logits.iter().all(|x| x.is_finite())
            && self.sh_coeffs.iter().flatten().flatten().all(|x| x.is_finite())
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            positions: self.positions.clone(),
            rotations: self.rotations.clone(),
            log_scales: self.log_scales.clone(),
            opacity_logits: self.opacity_logits.clone(),
            sh_coeffs: self.sh_coeffs.clone(),
            max_screen_radius: self.max_screen_radius.clone(),
            grad_norm_sum: self.accumulator.accumulated().to_vec(),
            observation_counts: self.accumulator.observation_counts().to_vec(),
            moments: self.moments.clone(),
        }
    }

    /// Rebuild a store from a snapshot, replacing nothing partially: any
    /// length mismatch rejects the whole snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self, StoreError> {
        let n = snapshot.positions.len();
        let store = Self {
            grads: ParamGrads::zeros(n),
            accumulator: GradientAccumulator::from_parts(
                snapshot.grad_norm_sum,
                snapshot.observation_counts,
            )?,
            positions: snapshot.positions,
            rotations: snapshot.rotations,
            log_scales: snapshot.log_scales,
            opacity_logits: snapshot.opacity_logits,
            sh_coeffs: snapshot.sh_coeffs,
            max_screen_radius: snapshot.max_screen_radius,
            moments: snapshot.moments,
            generation: 0,
        };
        store.check_invariants()?;
        Ok(store)
    }
}
