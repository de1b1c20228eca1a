//! Additive isotropic splat rasterizer (CPU).
//!
//! Each primitive is drawn as a circular Gaussian footprint with standard
//! deviation `fx * s / z` pixels, where `s` is the geometric mean of its
//! scales, truncated at `sigma_cutoff` standard deviations:
//!
//! ```text
//! C(p) = bg + sum_i alpha_i * w_i(p) * (c_i - bg)
//! w_i(p) = exp(-|p - uv_i|^2 / (2 sigma_i^2))
//! ```
//!
//! There is no depth sorting or occlusion, which keeps forward and backward
//! exact and cheap. Rotation does not affect the isotropic footprint, so its
//! gradient is zero. The SH view direction is treated as a constant.

use super::{BackwardOutput, Image, Rasterizer, RenderError, RenderOutput};
use crate::core::{num_sh_coeffs, perspective_jacobian, sh_basis, sigmoid, Camera, SH_COEFFS};
use crate::store::{GaussianStore, ParamGrads};
use nalgebra::{Vector2, Vector3, Vector4};
use rayon::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdditiveRasterizer {
    /// Camera-space depth below which primitives are culled.
    pub near: f32,
    /// Footprint truncation in standard deviations.
    pub sigma_cutoff: f32,
}

impl Default for AdditiveRasterizer {
    fn default() -> Self {
        Self {
            near: 0.01,
            sigma_cutoff: 3.0,
        }
    }
}

/// Per-primitive projection shared by forward and backward.
#[derive(Clone, Debug)]
struct Footprint {
    point_camera: Vector3<f32>,
    mean: Vector2<f32>,
    sigma: f32,
    radius: f32,
    x0: u32,
    x1: u32,
    y0: u32,
    y1: u32,
    alpha: f32,
    /// Color before the clamp at zero.
    raw_color: Vector3<f32>,
    basis: [f32; SH_COEFFS],
}

impl Footprint {
    fn color(&self) -> Vector3<f32> {
        self.raw_color.map(|c| c.max(0.0))
    }

    fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        (self.y0..self.y1).flat_map(move |y| (self.x0..self.x1).map(move |x| (x, y)))
    }

    /// Offset from the footprint mean to the center of pixel (x, y).
    fn offset(&self, x: u32, y: u32) -> Vector2<f32> {
        Vector2::new(x as f32 + 0.5, y as f32 + 0.5) - self.mean
    }

    fn weight(&self, d: &Vector2<f32>) -> f32 {
        (-0.5 * d.norm_squared() / (self.sigma * self.sigma)).exp()
    }
}

impl AdditiveRasterizer {
    fn project(&self, camera: &Camera, store: &GaussianStore, i: usize, degree: usize) -> Option<Footprint> {
        let position = store.positions()[i];
        let point_camera = camera.world_to_camera(&position);
        if point_camera.z <= self.near {
            return None;
        }
        let mean = camera.project(&point_camera)?;

        let mean_scale = (store.log_scales()[i].sum() / 3.0).exp();
        let sigma = camera.fx * mean_scale / point_camera.z;
        if !sigma.is_finite() || sigma <= 0.0 || !mean.iter().all(|v| v.is_finite()) {
            return None;
        }
        let radius = self.sigma_cutoff * sigma;

        let x0 = (mean.x - radius).floor().max(0.0);
        let y0 = (mean.y - radius).floor().max(0.0);
        let x1 = (mean.x + radius).ceil().min(camera.width as f32);
        let y1 = (mean.y + radius).ceil().min(camera.height as f32);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }

        let dir = position - camera.camera_center();
        let basis = sh_basis(&dir.normalize());
        let coeffs = &store.sh_coeffs()[i];
        let mut raw_color = Vector3::repeat(0.5);
        for (b, c) in basis.iter().zip(coeffs.iter()).take(num_sh_coeffs(degree)) {
            raw_color += Vector3::new(c[0], c[1], c[2]) * *b;
        }

        Some(Footprint {
            point_camera,
            mean,
            sigma,
            radius,
            x0: x0 as u32,
            x1: x1 as u32,
            y0: y0 as u32,
            y1: y1 as u32,
            alpha: sigmoid(store.opacity_logits()[i]),
            raw_color,
            basis,
        })
    }

    fn project_all(&self, camera: &Camera, store: &GaussianStore, degree: usize) -> Vec<Option<Footprint>> {
        (0..store.len())
            .into_par_iter()
            .map(|i| self.project(camera, store, i, degree))
            .collect()
    }
}

impl Rasterizer for AdditiveRasterizer {
    fn forward(
        &mut self,
        camera: &Camera,
        store: &GaussianStore,
        active_sh_degree: usize,
        background: Vector3<f32>,
    ) -> Result<RenderOutput, RenderError> {
        let footprints = self.project_all(camera, store, active_sh_degree);
        let mut image = Image::filled(camera.width, camera.height, background);

        for fp in footprints.iter().flatten() {
            let contribution = fp.color() - background;
            for (x, y) in fp.pixels() {
                let w = fp.weight(&fp.offset(x, y));
                image.pixels[(y * camera.width + x) as usize] += contribution * (fp.alpha * w);
            }
        }

        Ok(RenderOutput {
            image,
            visibility: footprints.iter().map(Option::is_some).collect(),
            radii: footprints
                .iter()
                .map(|fp| fp.as_ref().map_or(0.0, |fp| fp.radius))
                .collect(),
        })
    }

    fn backward(
        &mut self,
        camera: &Camera,
        store: &GaussianStore,
        active_sh_degree: usize,
        background: Vector3<f32>,
        forward: &RenderOutput,
        d_image: &[Vector3<f32>],
    ) -> Result<BackwardOutput, RenderError> {
        let n = store.len();
        forward.check_rows(n)?;
        let expected_pixels = (camera.width as usize) * (camera.height as usize);
        if d_image.len() != expected_pixels {
            return Err(RenderError::LengthMismatch {
                what: "d_image",
                expected: expected_pixels,
                actual: d_image.len(),
            });
        }

        let footprints = self.project_all(camera, store, active_sh_degree);
        let rotation_t = camera.rotation.transpose();
        let coeff_count = num_sh_coeffs(active_sh_degree);

        let per_row: Vec<Option<RowGrad>> = footprints
            .par_iter()
            .map(|fp| {
                let fp = fp.as_ref()?;
                let color = fp.color();
                let contribution = color - background;

                let mut d_mean = Vector2::<f32>::zeros();
                let mut d_sigma = 0.0f32;
                let mut d_color = Vector3::<f32>::zeros();
                let mut d_alpha = 0.0f32;
                let inv_var = 1.0 / (fp.sigma * fp.sigma);

                for (x, y) in fp.pixels() {
                    let g = d_image[(y * camera.width + x) as usize];
                    let d = fp.offset(x, y);
                    let w = fp.weight(&d);
                    let e = g.dot(&contribution);

                    d_color += g * (fp.alpha * w);
                    d_alpha += w * e;

                    let d_w = fp.alpha * e;
                    d_mean += d * (d_w * w * inv_var);
                    d_sigma += d_w * w * d.norm_squared() * inv_var / fp.sigma;
                }

                let mut sh = [[0.0f32; 3]; SH_COEFFS];
                for ch in 0..3 {
                    if fp.raw_color[ch] < 0.0 {
                        continue;
                    }
                    for (k, row) in sh.iter_mut().enumerate().take(coeff_count) {
                        row[ch] = fp.basis[k] * d_color[ch];
                    }
                }

                // sigma = fx * exp(mean(log_scale)) / z
                let z = fp.point_camera.z;
                let d_log_scale = Vector3::repeat(d_sigma * fp.sigma / 3.0);
                let mut d_point_camera = perspective_jacobian(&fp.point_camera, camera.fx, camera.fy).transpose() * d_mean;
                d_point_camera.z -= d_sigma * fp.sigma / z;

                Some(RowGrad {
                    position: rotation_t * d_point_camera,
                    log_scale: d_log_scale,
                    opacity: d_alpha * fp.alpha * (1.0 - fp.alpha),
                    sh,
                    viewspace_norm: d_mean.norm(),
                })
            })
            .collect();

        let mut grads = ParamGrads::zeros(n);
        let mut viewspace_grad_norms = vec![0.0f32; n];
        for (i, row) in per_row.into_iter().enumerate() {
            if let Some(row) = row {
                grads.position[i] = row.position;
                grads.rotation[i] = Vector4::zeros();
                grads.log_scale[i] = row.log_scale;
                grads.opacity[i] = row.opacity;
                grads.sh[i] = row.sh;
                viewspace_grad_norms[i] = row.viewspace_norm;
            }
        }

        Ok(BackwardOutput {
            grads,
            viewspace_grad_norms,
        })
    }
}

struct RowGrad {
    position: Vector3<f32>,
    log_scale: Vector3<f32>,
    opacity: f32,
    sh: [[f32; 3]; SH_COEFFS],
    viewspace_norm: f32,
}
