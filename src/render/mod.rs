//! Rasterizer contract.
//!
//! The trainer only talks to a rasterizer through [`Rasterizer`]:
//! - `forward` renders the store from one camera and reports, per primitive,
//!   whether it was visible and how large its screen footprint was
//! - `backward` turns dL/d(image) into parameter gradients plus the
//!   view-space (screen-mean) gradient norm used by density control
//!
//! [`AdditiveRasterizer`] is a small CPU implementation of the contract.

mod additive;

pub use additive::AdditiveRasterizer;

use crate::core::Camera;
use crate::store::{GaussianStore, ParamGrads};
use nalgebra::Vector3;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("rasterizer returned {actual} entries for `{what}`, store has {expected} rows")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("image is {actual_width}x{actual_height}, camera expects {width}x{height}")]
    ImageSize {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("rasterizer failure: {0}")]
    Backend(String),
}

/// Linear RGB image, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Vector3<f32>>,
}

impl Image {
    pub fn filled(width: u32, height: u32, color: Vector3<f32>) -> Self {
        Self {
            width,
            height,
            pixels: vec![color; (width as usize) * (height as usize)],
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Vector3<f32> {
        self.pixels[(y * self.width + x) as usize]
    }

    /// Reject an image whose size does not match `camera`.
    pub fn check_size(&self, camera: &Camera) -> Result<(), RenderError> {
        if self.width != camera.width
            || self.height != camera.height
            || self.pixels.len() != (self.width as usize) * (self.height as usize)
        {
            return Err(RenderError::ImageSize {
                width: camera.width,
                height: camera.height,
                actual_width: self.width,
                actual_height: self.height,
            });
        }
        Ok(())
    }
}

/// Result of a forward pass.
#[derive(Clone, Debug)]
pub struct RenderOutput {
    pub image: Image,
    /// `visibility[i]`: primitive `i` touched at least one pixel.
    pub visibility: Vec<bool>,
    /// Projected screen radius in pixels (0 when not visible).
    pub radii: Vec<f32>,
}

impl RenderOutput {
    pub fn check_rows(&self, n: usize) -> Result<(), RenderError> {
        check_rows("visibility", self.visibility.len(), n)?;
        check_rows("radii", self.radii.len(), n)
    }
}

/// Result of a backward pass.
#[derive(Clone, Debug)]
pub struct BackwardOutput {
    pub grads: ParamGrads,
    /// |dL/d(screen-space mean)| per primitive.
    pub viewspace_grad_norms: Vec<f32>,
}

impl BackwardOutput {
    pub fn check_rows(&self, n: usize) -> Result<(), RenderError> {
        check_rows("viewspace_grad_norms", self.viewspace_grad_norms.len(), n)?;
        check_rows("grads", self.grads.len(), n)?;
        self.grads.check_rows(n).map_err(|_| RenderError::LengthMismatch {
            what: "grads",
            expected: n,
            actual: self.grads.len(),
        })
    }
}

fn check_rows(what: &'static str, actual: usize, expected: usize) -> Result<(), RenderError> {
    if actual == expected {
        Ok(())
    } else {
        Err(RenderError::LengthMismatch {
            what,
            expected,
            actual,
        })
    }
}

/// A differentiable rasterizer over the whole store.
///
/// Only the first `(active_sh_degree + 1)^2` SH terms may be read.
pub trait Rasterizer {
    fn forward(
        &mut self,
        camera: &Camera,
        store: &GaussianStore,
        active_sh_degree: usize,
        background: Vector3<f32>,
    ) -> Result<RenderOutput, RenderError>;

    fn backward(
        &mut self,
        camera: &Camera,
        store: &GaussianStore,
        active_sh_degree: usize,
        background: Vector3<f32>,
        forward: &RenderOutput,
        d_image: &[Vector3<f32>],
    ) -> Result<BackwardOutput, RenderError>;
}
