//! Photometric losses.

use crate::render::Image;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    L1,
    L2,
    /// `(1 - λ) · L1 + λ · (1 - SSIM)`.
    #[default]
    L1Dssim,
}

/// Weight of the D-SSIM term in [`LossKind::L1Dssim`].
pub const DEFAULT_LAMBDA_DSSIM: f32 = 0.2;

const SSIM_RADIUS: i32 = 5; // 11x11
const SSIM_SIGMA: f32 = 1.5;
const SSIM_C1: f32 = 0.01 * 0.01;
const SSIM_C2: f32 = 0.03 * 0.03;

/// Image loss, returning (loss, d_rendered).
///
/// Every loss is averaged over pixels and channels. `lambda_dssim` is only
/// read by [`LossKind::L1Dssim`].
pub fn image_loss_and_grad(
    kind: LossKind,
    lambda_dssim: f32,
    rendered: &Image,
    target: &Image,
) -> (f32, Vec<Vector3<f32>>) {
    match kind {
        LossKind::L1 => l1_image_loss_and_grad(&rendered.pixels, &target.pixels),
        LossKind::L2 => l2_image_loss_and_grad(&rendered.pixels, &target.pixels),
        LossKind::L1Dssim => {
            let (l1, d_l1) = l1_image_loss_and_grad(&rendered.pixels, &target.pixels);
            let (dssim, d_dssim) =
                dssim_image_loss_and_grad(&rendered.pixels, &target.pixels, rendered.width, rendered.height);
            let l1_weight = 1.0 - lambda_dssim;
            let d = d_l1
                .iter()
                .zip(&d_dssim)
                .map(|(a, b)| a * l1_weight + b * lambda_dssim)
                .collect();
            (l1_weight * l1 + lambda_dssim * dssim, d)
        }
    }
}

// `f32::signum` maps 0.0 to 1.0; the L1 subgradient at zero is taken as 0.
fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Mean absolute error over an image, returning (loss, d_rendered).
pub fn l1_image_loss_and_grad(rendered: &[Vector3<f32>], target: &[Vector3<f32>]) -> (f32, Vec<Vector3<f32>>) {
    debug_assert_eq!(rendered.len(), target.len());
    let denom = (rendered.len() * 3).max(1) as f32;

    let mut loss = 0.0f32;
    let d = rendered
        .iter()
        .zip(target)
        .map(|(r, t)| {
            let diff = r - t;
            loss += diff.abs().sum();
            diff.map(sign) / denom
        })
        .collect();

    (loss / denom, d)
}

/// Mean squared error over an image, returning (loss, d_rendered).
pub fn l2_image_loss_and_grad(rendered: &[Vector3<f32>], target: &[Vector3<f32>]) -> (f32, Vec<Vector3<f32>>) {
    debug_assert_eq!(rendered.len(), target.len());
    let denom = (rendered.len() * 3).max(1) as f32;

    let mut loss = 0.0f32;
    let d = rendered
        .iter()
        .zip(target)
        .map(|(r, t)| {
            let diff = r - t;
            loss += diff.dot(&diff);
            diff * (2.0 / denom)
        })
        .collect();

    (loss / denom, d)
}

fn gaussian_window(radius: i32, sigma: f32) -> Vec<(i32, i32, f32)> {
    let denom = 2.0 * sigma * sigma;
    let mut out = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f32;
            out.push((dx, dy, (-r2 / denom).exp()));
        }
    }
    out
}

/// Mean structural dissimilarity `1 - SSIM`, returning (loss, d_rendered).
///
/// SSIM is computed per channel over an 11×11 Gaussian window (σ = 1.5).
/// At the image border the window is cut to the valid pixels and
/// renormalized.
pub fn dssim_image_loss_and_grad(
    rendered: &[Vector3<f32>],
    target: &[Vector3<f32>],
    width: u32,
    height: u32,
) -> (f32, Vec<Vector3<f32>>) {
    debug_assert_eq!(rendered.len(), target.len());
    debug_assert_eq!(rendered.len(), (width as usize) * (height as usize));
    let (w, h) = (width as i32, height as i32);
    let denom = (rendered.len() * 3).max(1) as f32;
    let window = gaussian_window(SSIM_RADIUS, SSIM_SIGMA);

    let mut loss = 0.0f32;
    let mut d = vec![Vector3::zeros(); rendered.len()];
    let mut taps: Vec<(usize, f32)> = Vec::with_capacity(window.len());

    for py in 0..h {
        for px in 0..w {
            taps.clear();
            for &(dx, dy, weight) in &window {
                let (x, y) = (px + dx, py + dy);
                if x >= 0 && x < w && y >= 0 && y < h {
                    taps.push(((y * w + x) as usize, weight));
                }
            }
            // The center tap is always inside, so the sum is at least 1.
            let weight_sum: f32 = taps.iter().map(|&(_, weight)| weight).sum();
            for tap in &mut taps {
                tap.1 /= weight_sum;
            }

            for ch in 0..3 {
                let (mut mu_x, mut mu_y) = (0.0f32, 0.0f32);
                for &(idx, wi) in &taps {
                    mu_x += wi * rendered[idx][ch];
                    mu_y += wi * target[idx][ch];
                }
                let (mut var_x, mut var_y, mut cov) = (0.0f32, 0.0f32, 0.0f32);
                for &(idx, wi) in &taps {
                    let dx = rendered[idx][ch] - mu_x;
                    let dy = target[idx][ch] - mu_y;
                    var_x += wi * dx * dx;
                    var_y += wi * dy * dy;
                    cov += wi * dx * dy;
                }

                let a = 2.0 * mu_x * mu_y + SSIM_C1;
                let b = 2.0 * cov + SSIM_C2;
                let c = mu_x * mu_x + mu_y * mu_y + SSIM_C1;
                let e = var_x + var_y + SSIM_C2;
                let ssim = (a * b) / (c * e);
                loss += 1.0 - ssim;

                let d_mu = 2.0 * mu_y * b / (c * e) - 2.0 * mu_x * ssim / c;
                let d_var = -ssim / e;
                let d_cov = 2.0 * a / (c * e);
                for &(idx, wi) in &taps {
                    let dx = rendered[idx][ch] - mu_x;
                    let dy = target[idx][ch] - mu_y;
                    let d_ssim = wi * (d_mu + 2.0 * d_var * dx + d_cov * dy);
                    d[idx][ch] -= d_ssim / denom;
                }
            }
        }
    }

    (loss / denom, d)
}
