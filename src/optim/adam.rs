//! Adam optimizer.
//!
//! The optimizer object only carries hyperparameters, per-group learning
//! rates and the global timestep. The per-primitive first/second moments
//! live in the primitive store (`store::ParamMoments`) so that a densify or
//! prune pass resizes them in the same call as the attributes.

use crate::core::ShCoeffs;
use crate::store::Moments;
use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-15,
        }
    }
}

/// Learning rate per attribute group.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningRates {
    /// Position LR before scaling by the scene extent; driven by the LR schedule.
    pub position: f32,
    pub rotation: f32,
    pub log_scale: f32,
    pub opacity: f32,
    /// DC SH term.
    pub sh_dc: f32,
    /// Higher-order SH terms.
    pub sh_rest: f32,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            position: 0.000_16,
            rotation: 0.001,
            log_scale: 0.005,
            opacity: 0.05,
            sh_dc: 0.0025,
            sh_rest: 0.0025 / 20.0,
        }
    }
}

/// Bias-corrected coefficients for one group at one timestep.
#[derive(Clone, Copy, Debug)]
pub struct AdamCoefficients {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub bias1: f32,
    pub bias2: f32,
}

pub struct Adam {
    pub config: AdamConfig,
    pub lrs: LearningRates,
    t: u32,
}

impl Adam {
    pub fn new(config: AdamConfig, lrs: LearningRates) -> Self {
        Self { config, lrs, t: 0 }
    }

    /// Number of steps taken so far. Not reset by densification.
    pub fn step_count(&self) -> u32 {
        self.t
    }

    /// Restore the timestep from a checkpoint.
    pub fn set_step_count(&mut self, t: u32) {
        self.t = t;
    }

    /// Advance the timestep; called once per optimizer step.
    pub(crate) fn advance(&mut self) {
        self.t += 1;
    }

    /// Coefficients for a group with learning rate `lr` at the current timestep.
    pub fn coefficients(&self, lr: f32) -> AdamCoefficients {
        let t = self.t.max(1) as i32;
        AdamCoefficients {
            lr,
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            eps: self.config.eps,
            bias1: 1.0 - self.config.beta1.powi(t),
            bias2: 1.0 - self.config.beta2.powi(t),
        }
    }
}

/// A value the optimizer can update component-wise.
pub trait AdamElement: Copy {
    fn zero() -> Self;

    fn adam_update(&mut self, grad: &Self, m: &mut Self, v: &mut Self, c: &AdamCoefficients);
}

#[inline]
fn scalar_update(p: &mut f32, g: f32, m: &mut f32, v: &mut f32, c: &AdamCoefficients) {
    *m = *m * c.beta1 + g * (1.0 - c.beta1);
    *v = *v * c.beta2 + g * g * (1.0 - c.beta2);

    let m_hat = *m / c.bias1;
    let v_hat = *v / c.bias2;
    *p -= c.lr * m_hat / (v_hat.sqrt() + c.eps);
}

impl AdamElement for f32 {
    fn zero() -> Self {
        0.0
    }

    fn adam_update(&mut self, grad: &Self, m: &mut Self, v: &mut Self, c: &AdamCoefficients) {
        scalar_update(self, *grad, m, v, c);
    }
}

impl AdamElement for Vector3<f32> {
    fn zero() -> Self {
        Vector3::zeros()
    }

    fn adam_update(&mut self, grad: &Self, m: &mut Self, v: &mut Self, c: &AdamCoefficients) {
        for k in 0..3 {
            scalar_update(&mut self[k], grad[k], &mut m[k], &mut v[k], c);
        }
    }
}

impl AdamElement for Vector4<f32> {
    fn zero() -> Self {
        Vector4::zeros()
    }

    fn adam_update(&mut self, grad: &Self, m: &mut Self, v: &mut Self, c: &AdamCoefficients) {
        for k in 0..4 {
            scalar_update(&mut self[k], grad[k], &mut m[k], &mut v[k], c);
        }
    }
}

/// One SH coefficient (RGB).
impl AdamElement for [f32; 3] {
    fn zero() -> Self {
        [0.0; 3]
    }

    fn adam_update(&mut self, grad: &Self, m: &mut Self, v: &mut Self, c: &AdamCoefficients) {
        for ch in 0..3 {
            scalar_update(&mut self[ch], grad[ch], &mut m[ch], &mut v[ch], c);
        }
    }
}

/// A full SH row at a single learning rate; [`adam_step_sh`] splits DC from the rest.
impl AdamElement for ShCoeffs {
    fn zero() -> Self {
        [[0.0; 3]; crate::core::SH_COEFFS]
    }

    fn adam_update(&mut self, grad: &Self, m: &mut Self, v: &mut Self, c: &AdamCoefficients) {
        for i in 0..self.len() {
            self[i].adam_update(&grad[i], &mut m[i], &mut v[i], c);
        }
    }
}

/// One Adam update over a row-aligned group.
pub fn adam_step<T: AdamElement>(
    params: &mut [T],
    grads: &[T],
    moments: &mut Moments<T>,
    c: &AdamCoefficients,
) {
    debug_assert_eq!(params.len(), grads.len());
    let (m, v) = moments.rows_mut();
    for (((p, g), m), v) in params.iter_mut().zip(grads).zip(m).zip(v) {
        p.adam_update(g, m, v, c);
    }
}

/// Adam over SH rows where the DC term and the higher-order terms use
/// different learning rates.
pub fn adam_step_sh(
    params: &mut [ShCoeffs],
    grads: &[ShCoeffs],
    moments: &mut Moments<ShCoeffs>,
    dc: &AdamCoefficients,
    rest: &AdamCoefficients,
) {
    debug_assert_eq!(params.len(), grads.len());
    let (m, v) = moments.rows_mut();
    for (((p, g), m), v) in params.iter_mut().zip(grads).zip(m).zip(v) {
        for i in 0..p.len() {
            let c = if i == 0 { dc } else { rest };
            p[i].adam_update(&g[i], &mut m[i], &mut v[i], c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn adam(lr: f32) -> Adam {
        let mut a = Adam::new(
            AdamConfig {
                eps: 1e-8,
                ..AdamConfig::default()
            },
            LearningRates::default(),
        );
        a.lrs.position = lr;
        a
    }

    #[test]
    fn test_adam_basic_update() {
        let mut opt = adam(0.01);
        opt.advance();
        let c = opt.coefficients(opt.lrs.position);

        let mut params = vec![Vector3::new(1.0, 1.0, 1.0)];
        let grads = vec![Vector3::new(1.0, -1.0, 0.0)];
        let mut moments = Moments::zeros(1);
        adam_step(&mut params, &grads, &mut moments, &c);

        // First bias-corrected step moves by exactly lr against the gradient sign.
        assert_relative_eq!(params[0].x, 0.99, epsilon = 1e-5);
        assert_relative_eq!(params[0].y, 1.01, epsilon = 1e-5);
        assert_relative_eq!(params[0].z, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_f32_basic_update() {
        let mut opt = adam(0.01);
        opt.advance();
        let c = opt.coefficients(0.01);
        let mut params = vec![1.0f32];
        let mut moments = Moments::zeros(1);
        adam_step(&mut params, &[1.0], &mut moments, &c);
        assert!(params[0] < 1.0);
        assert!(moments.first()[0] > 0.0);
    }

    #[test]
    fn test_sh_groups_use_their_own_rates() {
        let mut opt = adam(0.0);
        opt.advance();
        let dc = opt.coefficients(0.1);
        let rest = opt.coefficients(0.0);

        let mut params = vec![[[0.0f32; 3]; crate::core::SH_COEFFS]];
        let grads = vec![[[1.0f32; 3]; crate::core::SH_COEFFS]];
        let mut moments = Moments::zeros(1);
        adam_step_sh(&mut params, &grads, &mut moments, &dc, &rest);

        assert_relative_eq!(params[0][0][0], -0.1, epsilon = 1e-4);
        assert_relative_eq!(params[0][5][1], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_sh_step_with_equal_rates_matches_row_update() {
        let mut opt = adam(0.0);
        opt.advance();
        let c = opt.coefficients(0.05);

        let mut grads = [[0.0f32; 3]; crate::core::SH_COEFFS];
        for (k, g) in grads.iter_mut().enumerate() {
            *g = [k as f32 - 4.0, 0.5, -0.25 * k as f32];
        }
        let start = [[0.1f32; 3]; crate::core::SH_COEFFS];

        let mut split = vec![start];
        let mut split_moments = Moments::zeros(1);
        adam_step_sh(&mut split, &[grads], &mut split_moments, &c, &c);

        let mut whole = vec![start];
        let mut whole_moments = Moments::zeros(1);
        adam_step(&mut whole, &[grads], &mut whole_moments, &c);

        assert_eq!(split, whole);
        assert_eq!(split_moments, whole_moments);
    }

    #[test]
    fn test_timestep_survives_restore() {
        let mut opt = adam(0.01);
        opt.set_step_count(41);
        opt.advance();
        assert_eq!(opt.step_count(), 42);
    }
}
