//! Camera model (pinhole camera with intrinsics and extrinsics).
//!
//! Cameras are used to:
//! - Project 3D points to 2D image coordinates
//! - Transform Gaussians from world space to camera space
//! - Compute viewing directions for SH evaluation
//! - Estimate the scene extent that scales the density-control thresholds

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// A pinhole camera with intrinsic and extrinsic parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Camera {
    /// Focal length in X (pixels)
    pub fx: f32,

    /// Focal length in Y (pixels)
    pub fy: f32,

    /// Principal point X (pixels)
    pub cx: f32,

    /// Principal point Y (pixels)
    pub cy: f32,

    /// Image width (pixels)
    pub width: u32,

    /// Image height (pixels)
    pub height: u32,

    /// Rotation from world to camera coordinates
    pub rotation: Matrix3<f32>,

    /// Translation from world to camera coordinates
    pub translation: Vector3<f32>,
}

impl Camera {
    /// Create a new camera with given parameters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fx: f32,
        fy: f32,
        cx: f32,
        cy: f32,
        width: u32,
        height: u32,
        rotation: Matrix3<f32>,
        translation: Vector3<f32>,
    ) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            rotation,
            translation,
        }
    }

    /// Camera at `eye` looking at `target`, OpenCV convention (+z forward, +y down).
    pub fn look_at(
        eye: Vector3<f32>,
        target: Vector3<f32>,
        up: Vector3<f32>,
        focal: f32,
        width: u32,
        height: u32,
    ) -> Self {
        let forward = (target - eye).normalize();
        let right = forward.cross(&up).normalize();
        let down = forward.cross(&right);

        // Rows are the camera axes expressed in world coordinates.
        let rotation = Matrix3::from_rows(&[
            right.transpose(),
            down.transpose(),
            forward.transpose(),
        ]);
        let translation = -(rotation * eye);

        Self::new(
            focal,
            focal,
            width as f32 * 0.5,
            height as f32 * 0.5,
            width,
            height,
            rotation,
            translation,
        )
    }

    /// Transform a point from world coordinates to camera coordinates.
    ///
    /// p_camera = R * p_world + t
    pub fn world_to_camera(&self, point_world: &Vector3<f32>) -> Vector3<f32> {
        self.rotation * point_world + self.translation
    }

    /// Project a point in camera coordinates to pixel coordinates.
    ///
    /// Returns None if the point is behind the camera (z <= 0).
    pub fn project(&self, point_camera: &Vector3<f32>) -> Option<Vector2<f32>> {
        if point_camera.z <= 0.0 {
            return None;
        }

        let u = self.fx * point_camera.x / point_camera.z + self.cx;
        let v = self.fy * point_camera.y / point_camera.z + self.cy;
        Some(Vector2::new(u, v))
    }

    /// Project a point from world coordinates directly to pixel coordinates.
    pub fn world_to_pixel(&self, point_world: &Vector3<f32>) -> Option<Vector2<f32>> {
        self.project(&self.world_to_camera(point_world))
    }

    /// Camera center in world coordinates: C = -R^T * t
    pub fn camera_center(&self) -> Vector3<f32> {
        -self.rotation.transpose() * self.translation
    }

    /// Normalized direction from the camera center to a world point.
    pub fn view_direction(&self, point_world: &Vector3<f32>) -> Vector3<f32> {
        (point_world - self.camera_center()).normalize()
    }
}

/// Characteristic scene scale used by the density-control thresholds.
///
/// 1.1 × the largest distance of any camera center from the mean center.
/// Returns 1.0 for fewer than two distinct cameras.
pub fn scene_extent(cameras: &[Camera]) -> f32 {
    if cameras.is_empty() {
        return 1.0;
    }
    let centers: Vec<Vector3<f32>> = cameras.iter().map(Camera::camera_center).collect();
    let mean = centers.iter().fold(Vector3::zeros(), |acc, c| acc + c) / centers.len() as f32;
    let radius = centers
        .iter()
        .map(|c| (c - mean).norm())
        .fold(0.0f32, f32::max);

    if radius > 0.0 {
        radius * 1.1
    } else {
        1.0
    }
}
