//! Unit tests for core math invariants and small, deterministic examples.
//!
//! Each one checks a property the rasterizer, optimizer or density controller
//! relies on, with simple numbers you can verify by hand.

use approx::assert_relative_eq;
use densify_rs::core::{
    inverse_sigmoid, math::perspective_jacobian, scene_extent, sigmoid, Camera, Gaussian, SH_COEFFS,
};
use nalgebra::{Matrix3, Quaternion, SymmetricEigen, UnitQuaternion, Vector3};

#[test]
fn test_camera_world_to_camera_identity_rotation() {
    let camera = Camera::new(
        100.0,
        100.0,
        50.0,
        60.0,
        640,
        480,
        Matrix3::identity(),
        Vector3::new(1.0, 2.0, 3.0),
    );
    let point_world = Vector3::new(4.0, 5.0, 6.0);
    let point_camera = camera.world_to_camera(&point_world);

    // With identity rotation, world_to_camera should be point + translation.
    assert_relative_eq!(point_camera.x, 5.0, epsilon = 1e-6);
    assert_relative_eq!(point_camera.y, 7.0, epsilon = 1e-6);
    assert_relative_eq!(point_camera.z, 9.0, epsilon = 1e-6);
}

#[test]
fn test_camera_project_pinhole_example() {
    let camera = Camera::new(
        100.0,
        100.0,
        50.0,
        60.0,
        640,
        480,
        Matrix3::identity(),
        Vector3::zeros(),
    );
    let point_camera = Vector3::new(1.0, 2.0, 4.0);

    // u = fx * x / z + cx = 100 * 1 / 4 + 50 = 75
    // v = fy * y / z + cy = 100 * 2 / 4 + 60 = 110
    let pixel = camera.project(&point_camera).expect("point should be in front of camera");
    assert_relative_eq!(pixel.x, 75.0, epsilon = 1e-6);
    assert_relative_eq!(pixel.y, 110.0, epsilon = 1e-6);
}

#[test]
fn test_camera_project_rejects_points_behind_camera() {
    let camera = Camera::new(
        100.0,
        100.0,
        50.0,
        60.0,
        640,
        480,
        Matrix3::identity(),
        Vector3::zeros(),
    );
    let point_camera = Vector3::new(0.1, 0.1, -0.5);
    assert!(camera.project(&point_camera).is_none());
}

#[test]
fn test_perspective_jacobian_matches_finite_difference() {
    let fx = 320.0;
    let fy = 240.0;
    let cx = 50.0;
    let cy = 60.0;
    let p = Vector3::new(0.3, -1.2, 2.5);
    let eps = 1e-4;

    let j = perspective_jacobian(&p, fx, fy);

    let project_uv = |pt: Vector3<f32>| -> (f32, f32) {
        let u = fx * pt.x / pt.z + cx;
        let v = fy * pt.y / pt.z + cy;
        (u, v)
    };

    for axis in 0..3 {
        let mut p_plus = p;
        let mut p_minus = p;
        if axis == 0 {
            p_plus.x += eps;
            p_minus.x -= eps;
        } else if axis == 1 {
            p_plus.y += eps;
            p_minus.y -= eps;
        } else {
            p_plus.z += eps;
            p_minus.z -= eps;
        }

        let (u_plus, v_plus) = project_uv(p_plus);
        let (u_minus, v_minus) = project_uv(p_minus);
        let du = (u_plus - u_minus) / (2.0 * eps);
        let dv = (v_plus - v_minus) / (2.0 * eps);

        assert_relative_eq!(du, j[(0, axis)], epsilon = 1e-3);
        assert_relative_eq!(dv, j[(1, axis)], epsilon = 1e-3);
    }
}

#[test]
fn test_gaussian_covariance_symmetry_and_positive_definite() {
    let q = UnitQuaternion::from_euler_angles(0.2, -0.4, 0.1);
    // Stored unnormalized, as it may be between optimizer steps.
    let g = Gaussian::new(
        Vector3::new(0.0, 0.0, 0.0),
        q.into_inner() * 3.0,
        Vector3::new(-1.0, -2.0, -3.0),
        0.0,
        [[0.0f32; 3]; SH_COEFFS],
    );
    let cov = g.covariance_matrix();

    let symmetry_error = (cov - cov.transpose()).abs().max();
    assert!(symmetry_error < 1e-5, "covariance matrix not symmetric");

    let eig = SymmetricEigen::new(0.5 * (cov + cov.transpose()));
    for v in eig.eigenvalues.iter() {
        assert!(*v > 0.0, "eigenvalue not positive: {}", v);
    }

    // Normalization makes the covariance independent of the quaternion's norm.
    let unit = Gaussian::new(g.position, q.into_inner(), g.log_scale, 0.0, g.sh_coeffs);
    assert_relative_eq!(cov, unit.covariance_matrix(), epsilon = 1e-6);
}

#[test]
fn test_sigmoid_inverse_roundtrip() {
    for p in [0.005f32, 0.01, 0.1, 0.5, 0.9] {
        assert_relative_eq!(sigmoid(inverse_sigmoid(p)), p, epsilon = 1e-6);
    }
}

#[test]
fn test_zero_quaternion_falls_back_to_identity() {
    let g = Gaussian::new(
        Vector3::zeros(),
        Quaternion::new(0.0, 0.0, 0.0, 0.0),
        Vector3::zeros(),
        0.0,
        [[0.0f32; 3]; SH_COEFFS],
    );
    assert_relative_eq!(g.covariance_matrix(), Matrix3::identity(), epsilon = 1e-6);
}

#[test]
fn test_scene_extent_from_camera_ring() {
    let cameras: Vec<Camera> = (0..4)
        .map(|i| {
            let a = std::f32::consts::FRAC_PI_2 * i as f32;
            Camera::look_at(
                Vector3::new(2.0 * a.cos(), 0.0, 2.0 * a.sin()),
                Vector3::zeros(),
                Vector3::new(0.0, -1.0, 0.0),
                100.0,
                64,
                64,
            )
        })
        .collect();
    assert_relative_eq!(scene_extent(&cameras), 2.2, epsilon = 1e-4);
}
