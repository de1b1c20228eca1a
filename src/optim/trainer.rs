//! Training orchestration.
//!
//! `Trainer` owns the store, the optimizer and the rasterizer and runs one
//! iteration per [`Trainer::step`]:
//!
//! 1. learning-rate schedule and SH capability schedule
//! 2. sample a view, render, loss, backward, gradients into the store
//! 3. fold visibility / radii / view-space gradients into the statistics
//! 4. test and save hooks
//! 5. density control pass and opacity reset, when scheduled
//! 6. optimizer step
//! 7. checkpoint hook
//!
//! Every resize completes (attributes, statistics, Adam moments) before the
//! next forward pass.

use super::adam::Adam;
use super::config::{TrainConfig, TrainPhase};
use super::density::{DensifyParams, DensifyReport, DensityController};
use super::loss::image_loss_and_grad;
use super::schedule::{LrSchedule, ShDegreeSchedule};
use crate::core::{scene_extent, Camera, Gaussian};
use crate::io::{Checkpoint, CheckpointError};
use crate::render::{Image, Rasterizer, RenderError};
use crate::store::{GaussianStore, StoreError};
use nalgebra::Vector3;
use serde::Serialize;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use thiserror::Error;

/// Training views re-rendered at every test iteration (taken modulo the
/// view count), a fixed check for overfitting.
const TRAIN_EVAL_INDICES: [usize; 5] = [5, 10, 15, 20, 25];

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("no training views")]
    NoViews,

    #[error("non-finite loss {loss} at iteration {iteration}")]
    NonFiniteLoss { iteration: usize, loss: f32 },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("training hook failed: {0:#}")]
    Hook(anyhow::Error),
}

/// One posed training image.
#[derive(Clone, Debug)]
pub struct TrainView {
    pub name: String,
    pub camera: Camera,
    pub image: Image,
}

/// Which views an [`EvalReport`] covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalSet {
    /// Held-out views.
    Test,
    /// Fixed subset of the training views.
    Train,
}

impl EvalSet {
    pub fn name(self) -> &'static str {
        match self {
            EvalSet::Test => "test",
            EvalSet::Train => "train",
        }
    }
}

/// Image-quality summary passed to [`TrainingHooks::on_test`], once per set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalReport {
    pub set: EvalSet,
    pub iteration: usize,
    pub views: usize,
    pub l1: f32,
    pub psnr: f32,
    pub num_primitives: usize,
}

/// Save / test / checkpoint sinks. All methods default to no-ops.
pub trait TrainingHooks {
    fn on_test(&mut self, _report: &EvalReport) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_save(&mut self, _iteration: usize, _store: &GaussianStore) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_checkpoint(&mut self, _checkpoint: &Checkpoint) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl TrainingHooks for NoHooks {}

/// Without-replacement view order, reshuffled after every epoch.
#[derive(Clone, Debug)]
pub struct ViewSampler {
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl ViewSampler {
    pub fn new(num_views: usize, seed: u64) -> Self {
        Self {
            order: (0..num_views).collect(),
            cursor: num_views,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next view index; `None` only when there are no views.
    pub fn next_index(&mut self) -> Option<usize> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let i = self.order[self.cursor];
        self.cursor += 1;
        Some(i)
    }
}

/// What one iteration did.
#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub iteration: usize,
    pub phase: TrainPhase,
    pub loss: f32,
    pub num_primitives: usize,
    pub sh_degree_raised: bool,
    pub densify: Option<DensifyReport>,
    pub opacity_reset: bool,
}

pub struct Trainer {
    config: TrainConfig,
    store: GaussianStore,
    adam: Adam,
    rasterizer: Box<dyn Rasterizer>,
    density: DensityController,
    sh_schedule: ShDegreeSchedule,
    position_lr: Box<dyn LrSchedule>,
    views: Vec<TrainView>,
    test_views: Vec<TrainView>,
    sampler: ViewSampler,
    rng: StdRng,
    scene_extent: f32,
    /// Last completed iteration (0 before training).
    iteration: usize,
    ema_loss: Option<f32>,
}

impl Trainer {
    /// Start a fresh run from initial Gaussians.
    pub fn new(
        config: TrainConfig,
        initial: &[Gaussian],
        views: Vec<TrainView>,
        rasterizer: Box<dyn Rasterizer>,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        let cameras: Vec<Camera> = views.iter().map(|v| v.camera.clone()).collect();
        let extent = config.scene_extent.unwrap_or_else(|| scene_extent(&cameras));
        let store = GaussianStore::from_gaussians(initial);
        Self::assemble(config, store, views, rasterizer, extent, 0, 0, 0)
    }

    /// Resume after `checkpoint.iteration`.
    pub fn from_checkpoint(
        config: TrainConfig,
        checkpoint: &Checkpoint,
        views: Vec<TrainView>,
        rasterizer: Box<dyn Rasterizer>,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        let store = checkpoint.restore_store()?;
        let extent = config.scene_extent.unwrap_or(checkpoint.scene_extent);
        Self::assemble(
            config,
            store,
            views,
            rasterizer,
            extent,
            checkpoint.iteration,
            checkpoint.active_sh_degree,
            checkpoint.adam_step,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: TrainConfig,
        store: GaussianStore,
        views: Vec<TrainView>,
        rasterizer: Box<dyn Rasterizer>,
        extent: f32,
        iteration: usize,
        active_sh_degree: usize,
        adam_step: u32,
    ) -> Result<Self, TrainError> {
        if views.is_empty() {
            return Err(TrainError::NoViews);
        }
        for view in &views {
            view.image.check_size(&view.camera)?;
        }

        let mut adam = Adam::new(config.adam, config.learning_rates);
        adam.set_step_count(adam_step);

        let position_lr = config.position_lr(extent);
        let sh_schedule =
            ShDegreeSchedule::new(config.sh_degree_interval, config.max_sh_degree).with_active(active_sh_degree);

        // Resumed runs do not replay the random stream of the first segment.
        let seed = config.seed.wrapping_add(iteration as u64);

        tracing::info!(
            primitives = store.len(),
            views = views.len(),
            scene_extent = extent,
            start_iteration = iteration + 1,
            "trainer ready"
        );

        Ok(Self {
            density: DensityController::new(config.densify.clone()),
            sampler: ViewSampler::new(views.len(), seed ^ 0x5eed),
            rng: StdRng::seed_from_u64(seed),
            config,
            store,
            adam,
            rasterizer,
            sh_schedule,
            position_lr: Box::new(position_lr),
            views,
            test_views: Vec::new(),
            scene_extent: extent,
            iteration,
            ema_loss: None,
        })
    }

    /// Held-out views used by the test hook.
    pub fn with_test_views(mut self, test_views: Vec<TrainView>) -> Self {
        self.test_views = test_views;
        self
    }

    /// Replace the position learning-rate schedule.
    pub fn with_position_lr(mut self, schedule: Box<dyn LrSchedule>) -> Self {
        self.position_lr = schedule;
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn store(&self) -> &GaussianStore {
        &self.store
    }

    pub fn adam(&self) -> &Adam {
        &self.adam
    }

    /// Last completed iteration.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn active_sh_degree(&self) -> usize {
        self.sh_schedule.active()
    }

    pub fn scene_extent(&self) -> f32 {
        self.scene_extent
    }

    /// Phase of the next iteration.
    pub fn phase(&self) -> TrainPhase {
        self.config.phase(self.iteration + 1)
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == TrainPhase::Finished
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            iteration: self.iteration,
            active_sh_degree: self.sh_schedule.active(),
            max_sh_degree: self.sh_schedule.max_degree,
            adam_step: self.adam.step_count(),
            scene_extent: self.scene_extent,
            store: self.store.snapshot(),
        }
    }

    fn background(&mut self) -> Vector3<f32> {
        if self.config.random_background {
            Vector3::new(self.rng.gen(), self.rng.gen(), self.rng.gen())
        } else {
            self.fixed_background()
        }
    }

    fn fixed_background(&self) -> Vector3<f32> {
        if self.config.white_background {
            Vector3::repeat(1.0)
        } else {
            Vector3::zeros()
        }
    }

    /// Run iterations until the configured count is reached.
    pub fn run(&mut self, hooks: &mut dyn TrainingHooks) -> Result<(), TrainError> {
        let started = Instant::now();
        while !self.is_finished() {
            self.step(hooks)?;
        }
        tracing::info!(
            iterations = self.iteration,
            primitives = self.store.len(),
            elapsed_s = started.elapsed().as_secs_f32(),
            "training complete"
        );
        Ok(())
    }

    /// Run one iteration.
    pub fn step(&mut self, hooks: &mut dyn TrainingHooks) -> Result<StepReport, TrainError> {
        let iter = self.iteration + 1;
        let phase = self.config.phase(iter);
        self.store.check_invariants()?;

        self.adam.lrs.position = self.position_lr.lr_at(iter);
        let sh_degree_raised = self.sh_schedule.on_iteration(iter);
        let degree = self.sh_schedule.active();

        let view_idx = self.sampler.next_index().ok_or(TrainError::NoViews)?;
        let background = self.background();

        let n = self.store.len();
        let timer = Instant::now();
        let camera = &self.views[view_idx].camera;
        let target = &self.views[view_idx].image;
        let forward = self.rasterizer.forward(camera, &self.store, degree, background)?;
        forward.check_rows(n)?;
        forward.image.check_size(camera)?;

        let (loss, d_image) = image_loss_and_grad(self.config.loss, self.config.lambda_dssim, &forward.image, target);
        let finite = loss.is_finite();
        if !finite {
            if self.config.abort_on_non_finite {
                return Err(TrainError::NonFiniteLoss { iteration: iter, loss });
            }
            tracing::warn!(iteration = iter, loss, "non-finite loss, skipping gradient update");
        } else {
            let backward = self
                .rasterizer
                .backward(camera, &self.store, degree, background, &forward, &d_image)?;
            backward.check_rows(n)?;
            if !backward.grads.all_finite() {
                tracing::warn!(iteration = iter, "non-finite parameter gradients");
            }
            self.store.accumulate_grads(&backward.grads)?;

            if self.config.records_stats(iter) {
                self.store
                    .record_render_stats(&forward.visibility, &forward.radii, &backward.viewspace_grad_norms)?;
            }
        }
        tracing::debug!(iteration = iter, elapsed_ms = timer.elapsed().as_secs_f32() * 1000.0, "forward/backward");

        if finite {
            let ema = self.ema_loss.map_or(loss, |ema| 0.4 * loss + 0.6 * ema);
            self.ema_loss = Some(ema);
            if self.config.log_interval > 0 && iter % self.config.log_interval == 0 {
                tracing::info!(iteration = iter, loss = ema, primitives = n, sh_degree = degree, "progress");
            }
        }

        if self.config.test_iterations.contains(&iter) {
            for report in self.evaluate(iter)? {
                tracing::info!(
                    iteration = iter,
                    set = report.set.name(),
                    l1 = report.l1,
                    psnr = report.psnr,
                    views = report.views,
                    "evaluation"
                );
                hooks.on_test(&report).map_err(TrainError::Hook)?;
            }
        }
        if self.config.save_iterations.contains(&iter) || iter == self.config.iterations {
            tracing::info!(iteration = iter, primitives = self.store.len(), "saving Gaussians");
            hooks.on_save(iter, &self.store).map_err(TrainError::Hook)?;
        }

        let densify = if self.config.is_control_pass(iter) {
            let params = DensifyParams {
                grad_threshold: self.config.densify_grad_threshold,
                min_opacity: self.config.min_opacity,
                scene_extent: self.scene_extent,
                max_screen_size: self.config.max_screen_size_at(iter),
            };
            let report = self.density.densify_and_prune(&mut self.store, &params, &mut self.rng)?;
            tracing::info!(
                iteration = iter,
                before = report.before,
                cloned = report.cloned,
                split = report.split,
                pruned = report.pruned,
                after = report.after,
                "density control pass"
            );
            Some(report)
        } else {
            None
        };

        let opacity_reset = self.config.is_opacity_reset(iter);
        if opacity_reset {
            self.store.reset_opacity(self.config.opacity_reset_value);
            tracing::info!(iteration = iter, value = self.config.opacity_reset_value, "opacity reset");
        }

        if iter < self.config.iterations {
            self.store.optimizer_step(&mut self.adam)?;
        }
        self.store.zero_grad();
        self.iteration = iter;

        if self.config.checkpoint_iterations.contains(&iter) {
            tracing::info!(iteration = iter, "saving checkpoint");
            hooks.on_checkpoint(&self.checkpoint()).map_err(TrainError::Hook)?;
        }

        Ok(StepReport {
            iteration: iter,
            phase,
            loss,
            num_primitives: self.store.len(),
            sh_degree_raised,
            densify,
            opacity_reset,
        })
    }

    /// Mean L1 and PSNR over the held-out views (when there are any) and
    /// over a fixed subset of the training views. Empty sets are skipped.
    pub fn evaluate(&mut self, iteration: usize) -> Result<Vec<EvalReport>, TrainError> {
        let background = self.fixed_background();
        let degree = self.sh_schedule.active();
        let num_primitives = self.store.len();

        let train_subset: Vec<&TrainView> = if self.views.is_empty() {
            Vec::new()
        } else {
            TRAIN_EVAL_INDICES.iter().map(|i| &self.views[i % self.views.len()]).collect()
        };
        let test_views: Vec<&TrainView> = self.test_views.iter().collect();

        let mut reports = Vec::with_capacity(2);
        for (set, views) in [(EvalSet::Test, test_views), (EvalSet::Train, train_subset)] {
            if views.is_empty() {
                continue;
            }
            let (l1, psnr) = mean_image_metrics(self.rasterizer.as_mut(), &self.store, &views, degree, background)?;
            reports.push(EvalReport {
                set,
                iteration,
                views: views.len(),
                l1,
                psnr,
                num_primitives,
            });
        }
        Ok(reports)
    }
}

/// Mean (L1, PSNR) of `views` rendered from `store`, with the render clamped to [0, 1].
fn mean_image_metrics(
    rasterizer: &mut dyn Rasterizer,
    store: &GaussianStore,
    views: &[&TrainView],
    degree: usize,
    background: Vector3<f32>,
) -> Result<(f32, f32), TrainError> {
    let mut l1_sum = 0.0f32;
    let mut psnr_sum = 0.0f32;
    for view in views {
        let out = rasterizer.forward(&view.camera, store, degree, background)?;
        let mut abs = 0.0f32;
        let mut sq = 0.0f32;
        for (r, t) in out.image.pixels.iter().zip(&view.image.pixels) {
            let diff = r.map(|c| c.clamp(0.0, 1.0)) - t;
            abs += diff.abs().sum();
            sq += diff.norm_squared();
        }
        let count = (view.image.pixels.len() * 3).max(1) as f32;
        l1_sum += abs / count;
        psnr_sum += psnr(sq / count);
    }
    let count = views.len().max(1) as f32;
    Ok((l1_sum / count, psnr_sum / count))
}

/// PSNR in dB for images in [0, 1].
pub fn psnr(mse: f32) -> f32 {
    if mse <= 0.0 {
        return f32::INFINITY;
    }
    -10.0 * mse.log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_sampler_visits_each_view_once_per_epoch() {
        let mut sampler = ViewSampler::new(7, 3);
        for _ in 0..3 {
            let mut seen: Vec<usize> = (0..7).filter_map(|_| sampler.next_index()).collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..7).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_view_sampler_empty() {
        assert_eq!(ViewSampler::new(0, 1).next_index(), None);
    }

    #[test]
    fn test_psnr() {
        assert!((psnr(0.01) - 20.0).abs() < 1e-4);
        assert!(psnr(0.0).is_infinite());
    }
}
