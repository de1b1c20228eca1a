//! Spherical harmonics evaluation for view-dependent color.
//!
//! Gaussians store color as real SH coefficients (degree ≤ 3, 16 terms per
//! channel). Only the first `(degree + 1)^2` terms are read for the currently
//! active degree; the rest stay in storage untouched.

use super::gaussian::{ShCoeffs, MAX_SH_DEGREE, SH_COEFFS};
use nalgebra::Vector3;

/// Y_0^0
pub const SH_C0: f32 = 0.282_094_8;
const SH_C1: f32 = 0.488_602_5;
const SH_C2: [f32; 5] = [1.092_548_4, -1.092_548_4, 0.315_391_57, -1.092_548_4, 0.546_274_2];
const SH_C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_33,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];

/// Number of basis terms read at a given degree (clamped to the storage capacity).
pub fn num_sh_coeffs(degree: usize) -> usize {
    let d = degree.min(MAX_SH_DEGREE) + 1;
    d * d
}

/// Evaluate the real SH basis up to degree 3 for a unit direction.
///
/// Ordering per degree l is m = -l..=l.
pub fn sh_basis(direction: &Vector3<f32>) -> [f32; SH_COEFFS] {
    let (x, y, z) = (direction.x, direction.y, direction.z);
    let (xx, yy, zz) = (x * x, y * y, z * z);

    [
        SH_C0,
        -SH_C1 * y,
        SH_C1 * z,
        -SH_C1 * x,
        SH_C2[0] * x * y,
        SH_C2[1] * y * z,
        SH_C2[2] * (2.0 * zz - xx - yy),
        SH_C2[3] * x * z,
        SH_C2[4] * (xx - yy),
        SH_C3[0] * y * (3.0 * xx - yy),
        SH_C3[1] * x * y * z,
        SH_C3[2] * y * (4.0 * zz - xx - yy),
        SH_C3[3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy),
        SH_C3[4] * x * (4.0 * zz - xx - yy),
        SH_C3[5] * z * (xx - yy),
        SH_C3[6] * x * (xx - 3.0 * yy),
    ]
}

/// Evaluate view-dependent color using the first `degree` levels.
///
/// Returns the raw (unclamped) linear RGB so callers can decide how to
/// clamp and differentiate.
pub fn evaluate_sh(sh_coeffs: &ShCoeffs, direction: &Vector3<f32>, degree: usize) -> Vector3<f32> {
    let dir = direction.normalize();
    let basis = sh_basis(&dir);

    let mut color = Vector3::<f32>::zeros();
    for (b, c) in basis.iter().zip(sh_coeffs.iter()).take(num_sh_coeffs(degree)) {
        color.x += b * c[0];
        color.y += b * c[1];
        color.z += b * c[2];
    }
    color
}
