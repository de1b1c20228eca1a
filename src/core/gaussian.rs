//! A single Gaussian primitive, as one row of the primitive store.
//!
//! A Gaussian is parameterized by:
//! - Position (mean μ)
//! - Rotation (4 raw quaternion components, normalized before rendering)
//! - Scale (log-space: exp(log_scale) gives actual scale)
//! - Opacity (logit-space: sigmoid(opacity_logit) gives actual opacity)
//! - Spherical harmonics coefficients (view-dependent color)

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Highest SH degree the coefficient storage can hold.
pub const MAX_SH_DEGREE: usize = 3;

/// Number of SH basis terms for `MAX_SH_DEGREE`: (3 + 1)^2.
pub const SH_COEFFS: usize = (MAX_SH_DEGREE + 1) * (MAX_SH_DEGREE + 1);

/// RGB coefficients for every SH basis term. Index 0 is the DC term.
pub type ShCoeffs = [[f32; 3]; SH_COEFFS];

/// A 3D Gaussian primitive.
///
/// Covariance is stored factorized as scale + rotation:
/// Σ = R · S · S^T · R^T where S = diag(exp(log_scale))
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gaussian {
    /// Position (mean μ)
    pub position: Vector3<f32>,

    /// Orientation. The optimizer updates the raw components, so this may
    /// drift off the unit sphere between steps.
    pub rotation: Quaternion<f32>,

    /// Log-space scale (actual scale = exp(log_scale))
    pub log_scale: Vector3<f32>,

    /// Opacity in logit-space (actual opacity = sigmoid(opacity_logit))
    pub opacity_logit: f32,

    /// Spherical harmonics coefficients, full capacity regardless of the
    /// currently active degree.
    pub sh_coeffs: ShCoeffs,
}

impl Gaussian {
    /// Create a new Gaussian with given parameters.
    pub fn new(
        position: Vector3<f32>,
        rotation: Quaternion<f32>,
        log_scale: Vector3<f32>,
        opacity_logit: f32,
        sh_coeffs: ShCoeffs,
    ) -> Self {
        Self {
            position,
            rotation,
            log_scale,
            opacity_logit,
            sh_coeffs,
        }
    }

    /// Rotation projected back onto the unit sphere, as the rasterizer needs it.
    pub fn normalized_rotation(&self) -> UnitQuaternion<f32> {
        normalize_rotation(&self.rotation)
    }

    /// Get the actual opacity value (sigmoid of stored logit value)
    pub fn actual_opacity(&self) -> f32 {
        crate::core::sigmoid(self.opacity_logit)
    }

    /// Get the actual scale values (exp of stored log values)
    pub fn actual_scale(&self) -> Vector3<f32> {
        self.log_scale.map(f32::exp)
    }

    /// Largest world-space extent along any principal axis.
    pub fn max_scale(&self) -> f32 {
        self.actual_scale().max()
    }

    /// Compute the 3D covariance matrix Σ = R · S² · R^T
    pub fn covariance_matrix(&self) -> Matrix3<f32> {
        let r = crate::core::quaternion_to_matrix(&self.normalized_rotation());
        let s = self.actual_scale();
        let s_squared = Matrix3::from_diagonal(&s.component_mul(&s));
        r * s_squared * r.transpose()
    }
}

/// Normalize raw quaternion components. A degenerate (zero) quaternion maps to identity.
pub(crate) fn normalize_rotation(q: &Quaternion<f32>) -> UnitQuaternion<f32> {
    let n = q.norm();
    if n.is_finite() && n > 1e-12 {
        UnitQuaternion::new_unchecked(*q / n)
    } else {
        UnitQuaternion::identity()
    }
}
