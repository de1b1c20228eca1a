//! Core data structures and mathematical operations.
//!
//! This module contains the fundamental types used throughout the system:
//! - `Gaussian`: one primitive (a single row of the store)
//! - `Camera`: Camera intrinsics and extrinsics
//! - Math utilities: activations, quaternions, projection Jacobian
//! - Spherical harmonics basis for view-dependent color
//!
//! All types here are "pure data" - no I/O, no training logic.

mod camera;
mod gaussian;
pub mod init;
pub mod math;
mod sh;

// Re-export public types
pub use camera::{scene_extent, Camera};
pub use gaussian::{Gaussian, ShCoeffs, MAX_SH_DEGREE, SH_COEFFS};
pub(crate) use gaussian::normalize_rotation;
pub use init::{init_from_points, rgb_to_sh_dc, ScenePoint};
pub use math::{inverse_sigmoid, perspective_jacobian, quaternion_to_matrix, sigmoid};
pub use sh::{evaluate_sh, num_sh_coeffs, sh_basis, SH_C0};
