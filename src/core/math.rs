//! Mathematical utilities (activations, quaternions, projection Jacobian).

use nalgebra::{Matrix2x3, Matrix3, UnitQuaternion, Vector3};

/// Convert a unit quaternion to a 3×3 rotation matrix.
///
/// R = | 1-2(y²+z²)   2(xy-wz)    2(xz+wy)  |
///     | 2(xy+wz)     1-2(x²+z²)  2(yz-wx)  |
///     | 2(xz-wy)     2(yz+wx)    1-2(x²+y²)|
pub fn quaternion_to_matrix(q: &UnitQuaternion<f32>) -> Matrix3<f32> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    )
}

/// Sigmoid activation function: σ(x) = 1 / (1 + e^(-x))
///
/// Maps R → (0, 1). Used for opacity.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Inverse sigmoid (logit): logit(p) = log(p / (1-p))
///
/// Maps (0, 1) → R. Inputs are clamped away from 0 and 1.
pub fn inverse_sigmoid(p: f32) -> f32 {
    let p_clamped = p.clamp(1e-6, 1.0 - 1e-6);
    (p_clamped / (1.0 - p_clamped)).ln()
}

/// Jacobian of the pinhole projection [u, v] = [fx*x/z + cx, fy*y/z + cy]
/// with respect to the camera-space point [x, y, z]:
///
/// J = | fx/z    0      -fx*x/z² |
///     |  0     fy/z    -fy*y/z² |
pub fn perspective_jacobian(point_camera: &Vector3<f32>, fx: f32, fy: f32) -> Matrix2x3<f32> {
    let z_inv = 1.0 / point_camera.z;
    let z_inv_sq = z_inv * z_inv;

    Matrix2x3::new(
        fx * z_inv,
        0.0,
        -fx * point_camera.x * z_inv_sq,
        0.0,
        fy * z_inv,
        -fy * point_camera.y * z_inv_sq,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sigmoid() {
        assert_relative_eq!(sigmoid(0.0), 0.5, epsilon = 1e-6);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
    }

    #[test]
    fn test_inverse_sigmoid_of_reset_value() {
        let x = inverse_sigmoid(0.01);
        assert_relative_eq!(sigmoid(x), 0.01, epsilon = 1e-6);
    }

    #[test]
    fn test_quaternion_to_matrix_matches_nalgebra() {
        let q = UnitQuaternion::from_euler_angles(0.5, -0.3, 1.2);
        let r = quaternion_to_matrix(&q);
        assert_relative_eq!(r, q.to_rotation_matrix().into_inner(), epsilon = 1e-5);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_perspective_jacobian_matches_finite_difference() {
        let p = Vector3::new(0.3, -0.2, 2.0);
        let (fx, fy) = (100.0, 120.0);
        let j = perspective_jacobian(&p, fx, fy);

        let project = |p: Vector3<f32>| (fx * p.x / p.z, fy * p.y / p.z);
        let h = 1e-3;
        let (u0, v0) = project(p - Vector3::new(0.0, 0.0, h));
        let (u1, v1) = project(p + Vector3::new(0.0, 0.0, h));
        assert_relative_eq!(j[(0, 2)], (u1 - u0) / (2.0 * h), epsilon = 1e-2);
        assert_relative_eq!(j[(1, 2)], (v1 - v0) / (2.0 * h), epsilon = 1e-2);
    }
}
