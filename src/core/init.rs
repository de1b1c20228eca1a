//! Initialization of Gaussians from a sparse point set.
//!
//! The initial population comes from scene initialization (e.g. a
//! structure-from-motion point cloud). Each point becomes one Gaussian with:
//! - Position from the point
//! - Isotropic scale from the mean squared distance to its 3 nearest neighbours
//! - Identity rotation
//! - Low opacity (0.1)
//! - Color in the DC SH coefficient, relative to the 0.5 gray the
//!   rasterizer adds back

use super::gaussian::{Gaussian, SH_COEFFS};
use super::math::inverse_sigmoid;
use super::sh::SH_C0;
use nalgebra::{Quaternion, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Opacity given to freshly initialized Gaussians.
const INITIAL_OPACITY: f32 = 0.1;

/// Lower bound on the squared neighbour distance, keeps log-scale finite
/// for duplicated points.
const MIN_DIST_SQ: f32 = 1e-7;

/// Number of neighbours averaged for the initial scale.
const NEIGHBOURS: usize = 3;

/// One input point: position plus linear RGB color in [0, 1].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScenePoint {
    pub position: Vector3<f32>,
    pub color: [f32; 3],
}

/// Mean squared distance to the `NEIGHBOURS` nearest other points.
///
/// Brute force; initial point clouds for this trainer are small enough.
fn mean_knn_dist_sq(points: &[ScenePoint], i: usize) -> f32 {
    let p = points[i].position;
    let mut best = [f32::INFINITY; NEIGHBOURS];

    for (j, other) in points.iter().enumerate() {
        if j == i {
            continue;
        }
        let d = (other.position - p).norm_squared();
        if d < best[NEIGHBOURS - 1] {
            best[NEIGHBOURS - 1] = d;
            best.sort_by(|a, b| a.total_cmp(b));
        }
    }

    let found: Vec<f32> = best.iter().copied().filter(|d| d.is_finite()).collect();
    if found.is_empty() {
        return 1.0;
    }
    found.iter().sum::<f32>() / found.len() as f32
}

/// DC coefficient that reproduces `rgb` once the 0.5 offset is added.
pub fn rgb_to_sh_dc(rgb: f32) -> f32 {
    (rgb - 0.5) / SH_C0
}

/// Initialize one Gaussian per input point.
pub fn init_from_points(points: &[ScenePoint]) -> Vec<Gaussian> {
    (0..points.len())
        .into_par_iter()
        .map(|i| {
            let point = &points[i];
            let dist_sq = mean_knn_dist_sq(points, i).max(MIN_DIST_SQ);
            let log_scale = Vector3::repeat(dist_sq.sqrt().ln());

            let mut sh_coeffs = [[0.0f32; 3]; SH_COEFFS];
            sh_coeffs[0] = point.color.map(rgb_to_sh_dc);

            Gaussian::new(
                point.position,
                Quaternion::identity(),
                log_scale,
                inverse_sigmoid(INITIAL_OPACITY),
                sh_coeffs,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pt(x: f32, y: f32, z: f32) -> ScenePoint {
        ScenePoint {
            position: Vector3::new(x, y, z),
            color: [0.5, 0.25, 1.0],
        }
    }

    #[test]
    fn test_scale_from_neighbour_spacing() {
        // Unit-spaced points on a line: the middle point's 3-NN distances are 1, 1, 2.
        let points: Vec<ScenePoint> = (0..5).map(|i| pt(i as f32, 0.0, 0.0)).collect();
        let gaussians = init_from_points(&points);

        let expected = ((1.0 + 1.0 + 4.0) / 3.0f32).sqrt().ln();
        assert_relative_eq!(gaussians[2].log_scale.x, expected, epsilon = 1e-5);
        assert_relative_eq!(gaussians[2].log_scale.z, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_color_and_opacity() {
        let gaussians = init_from_points(&[pt(0.0, 0.0, 0.0), pt(1.0, 0.0, 0.0)]);
        assert_eq!(gaussians.len(), 2);
        assert_relative_eq!(gaussians[0].sh_coeffs[0][0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(gaussians[0].sh_coeffs[0][2] * SH_C0 + 0.5, 1.0, epsilon = 1e-6);
        assert_relative_eq!(gaussians[0].actual_opacity(), INITIAL_OPACITY, epsilon = 1e-5);
        // Only one neighbour exists.
        assert_relative_eq!(gaussians[0].log_scale.x, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_single_point_gets_unit_scale() {
        let gaussians = init_from_points(&[pt(3.0, 2.0, 1.0)]);
        assert_relative_eq!(gaussians[0].max_scale(), 1.0, epsilon = 1e-6);
    }
}
