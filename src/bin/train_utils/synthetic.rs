//! Synthetic training scene: a cloud of colored blobs seen from a ring of cameras.
//!
//! Target images are rendered from a hidden ground-truth set of Gaussians;
//! training starts from a sparse, jittered subset of their centers, so the
//! density controller has real work to do.

use densify_rs::core::{inverse_sigmoid, rgb_to_sh_dc, Camera, Gaussian, ScenePoint, SH_COEFFS};
use densify_rs::optim::TrainView;
use densify_rs::render::{AdditiveRasterizer, Rasterizer, RenderError};
use densify_rs::store::GaussianStore;
use nalgebra::{Quaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Distance of the camera ring from the origin.
const RING_RADIUS: f32 = 4.0;

pub struct SceneSpec {
    pub blobs: usize,
    pub views: usize,
    pub resolution: u32,
    pub init_points: usize,
    pub seed: u64,
    pub background: Vector3<f32>,
}

pub struct SyntheticScene {
    pub views: Vec<TrainView>,
    pub points: Vec<ScenePoint>,
}

fn ring_camera(i: usize, views: usize, resolution: u32) -> Camera {
    let theta = std::f32::consts::TAU * i as f32 / views.max(1) as f32;
    let eye = Vector3::new(
        RING_RADIUS * theta.cos(),
        0.5 * (2.0 * theta).sin(),
        RING_RADIUS * theta.sin(),
    );
    Camera::look_at(
        eye,
        Vector3::zeros(),
        Vector3::new(0.0, -1.0, 0.0),
        resolution as f32,
        resolution,
        resolution,
    )
}

fn random_color(rng: &mut StdRng) -> [f32; 3] {
    [rng.gen_range(0.05..0.95), rng.gen_range(0.05..0.95), rng.gen_range(0.05..0.95)]
}

pub fn build(params: &SceneSpec) -> Result<SyntheticScene, RenderError> {
    let mut rng = StdRng::seed_from_u64(params.seed);

    let truth: Vec<(Vector3<f32>, [f32; 3])> = (0..params.blobs.max(1))
        .map(|_| {
            let p = Vector3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            (p, random_color(&mut rng))
        })
        .collect();

    let gaussians: Vec<Gaussian> = truth
        .iter()
        .map(|(p, color)| {
            let mut sh = [[0.0; 3]; SH_COEFFS];
            sh[0] = color.map(rgb_to_sh_dc);
            let scale: f32 = rng.gen_range(0.05..0.2);
            Gaussian::new(*p, Quaternion::identity(), Vector3::repeat(scale.ln()), inverse_sigmoid(0.8), sh)
        })
        .collect();
    let store = GaussianStore::from_gaussians(&gaussians);

    let mut rasterizer = AdditiveRasterizer::default();
    let mut views = Vec::with_capacity(params.views);
    for i in 0..params.views {
        let camera = ring_camera(i, params.views, params.resolution);
        let rendered = rasterizer.forward(&camera, &store, 0, params.background)?;
        let mut image = rendered.image;
        image.pixels.iter_mut().for_each(|p| *p = p.map(|c| c.clamp(0.0, 1.0)));
        views.push(TrainView {
            name: format!("view_{i:03}"),
            camera,
            image,
        });
    }

    let points = (0..params.init_points.max(1))
        .map(|i| {
            let (p, color) = truth[i % truth.len()];
            let jitter = Vector3::new(
                rng.gen_range(-0.1..0.1),
                rng.gen_range(-0.1..0.1),
                rng.gen_range(-0.1..0.1),
            );
            let noisy = color.map(|c| (c + rng.gen_range(-0.2..0.2)).clamp(0.0, 1.0));
            ScenePoint {
                position: p + jitter,
                color: noisy,
            }
        })
        .collect();

    Ok(SyntheticScene { views, points })
}
