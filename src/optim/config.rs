//! Training configuration.
//!
//! Every field has a default, so a JSON file only needs the keys it changes:
//!
//! ```json
//! { "iterations": 7000, "white_background": true, "densify": { "max_primitives": 500000 } }
//! ```

use super::adam::{AdamConfig, LearningRates};
use super::density::DensifyConfig;
use super::loss::{LossKind, DEFAULT_LAMBDA_DSSIM};
use super::schedule::ExponentialDecayLr;
use super::trainer::TrainError;
use crate::core::MAX_SH_DEGREE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where an iteration sits in the densification schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainPhase {
    /// `iteration <= densify_from_iter`: statistics accumulate, no control passes.
    Warmup,
    /// Control passes and opacity resets are scheduled.
    ActiveDensify,
    /// `iteration >= densify_until_iter`: N is frozen.
    PostDensify,
    /// `iteration > iterations`.
    Finished,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub iterations: usize,

    pub densify_from_iter: usize,
    pub densify_until_iter: usize,
    pub densification_interval: usize,
    pub densify_grad_threshold: f32,
    pub opacity_reset_interval: usize,
    pub opacity_reset_value: f32,
    pub min_opacity: f32,

    /// Screen-radius prune bound in pixels.
    pub max_screen_size: f32,
    /// Control passes to run before screen-size pruning is enabled.
    pub screen_size_warmup_passes: usize,
    pub densify: DensifyConfig,

    pub max_sh_degree: usize,
    pub sh_degree_interval: usize,

    pub white_background: bool,
    pub random_background: bool,
    pub loss: LossKind,
    /// Weight of the D-SSIM term when `loss` is `l1_dssim`.
    pub lambda_dssim: f32,

    pub adam: AdamConfig,
    pub learning_rates: LearningRates,
    pub position_lr_final: f32,
    /// Iterations over which the position rate ramps up from
    /// `position_lr_delay_mult` times its scheduled value.
    pub position_lr_delay_steps: usize,
    pub position_lr_delay_mult: f32,
    pub position_lr_max_steps: usize,

    /// Overrides the extent estimated from the camera centers.
    pub scene_extent: Option<f32>,

    pub save_iterations: Vec<usize>,
    pub test_iterations: Vec<usize>,
    pub checkpoint_iterations: Vec<usize>,
    pub log_interval: usize,

    pub seed: u64,
    pub abort_on_non_finite: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            iterations: 30_000,
            densify_from_iter: 500,
            densify_until_iter: 15_000,
            densification_interval: 100,
            densify_grad_threshold: 0.0002,
            opacity_reset_interval: 3000,
            opacity_reset_value: 0.01,
            min_opacity: 0.005,
            max_screen_size: 20.0,
            screen_size_warmup_passes: 25,
            densify: DensifyConfig::default(),
            max_sh_degree: MAX_SH_DEGREE,
            sh_degree_interval: 1000,
            white_background: false,
            random_background: false,
            loss: LossKind::default(),
            lambda_dssim: DEFAULT_LAMBDA_DSSIM,
            adam: AdamConfig::default(),
            learning_rates: LearningRates::default(),
            position_lr_final: 0.000_001_6,
            position_lr_delay_steps: 0,
            position_lr_delay_mult: 0.01,
            position_lr_max_steps: 30_000,
            scene_extent: None,
            save_iterations: vec![7000, 30_000],
            test_iterations: vec![7000, 30_000],
            checkpoint_iterations: Vec::new(),
            log_interval: 10,
            seed: 0,
            abort_on_non_finite: true,
        }
    }
}

impl TrainConfig {
    pub fn from_json_str(json: &str) -> Result<Self, TrainError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, TrainError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String, TrainError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        let invalid = |msg: &str| Err(TrainError::InvalidConfig(msg.to_string()));
        if self.densification_interval == 0 {
            return invalid("densification_interval must be > 0");
        }
        if self.opacity_reset_interval == 0 {
            return invalid("opacity_reset_interval must be > 0");
        }
        if self.max_sh_degree > MAX_SH_DEGREE {
            return invalid("max_sh_degree must be <= 3");
        }
        if !(self.opacity_reset_value > 0.0 && self.opacity_reset_value < 1.0) {
            return invalid("opacity_reset_value must be in (0, 1)");
        }
        // Children must come out strictly smaller than their parent.
        if !(self.densify.split_scale_divisor > 1.0) {
            return invalid("densify.split_scale_divisor must be > 1");
        }
        if !(0.0..=1.0).contains(&self.lambda_dssim) {
            return invalid("lambda_dssim must be in [0, 1]");
        }
        if matches!(self.scene_extent, Some(e) if !(e > 0.0 && e.is_finite())) {
            return invalid("scene_extent must be positive and finite");
        }
        Ok(())
    }

    /// Phase of `iteration`; a pure function so a restored run resumes in
    /// the same phase.
    pub fn phase(&self, iteration: usize) -> TrainPhase {
        if iteration > self.iterations {
            TrainPhase::Finished
        } else if iteration <= self.densify_from_iter {
            TrainPhase::Warmup
        } else if iteration < self.densify_until_iter {
            TrainPhase::ActiveDensify
        } else {
            TrainPhase::PostDensify
        }
    }

    /// Statistics are recorded while `iteration < densify_until_iter`.
    pub fn records_stats(&self, iteration: usize) -> bool {
        iteration < self.densify_until_iter
    }

    pub fn is_control_pass(&self, iteration: usize) -> bool {
        self.records_stats(iteration)
            && iteration > self.densify_from_iter
            && iteration % self.densification_interval == 0
    }

    pub fn is_opacity_reset(&self, iteration: usize) -> bool {
        self.records_stats(iteration)
            && (iteration % self.opacity_reset_interval == 0
                || (self.white_background && iteration == self.densify_from_iter))
    }

    /// Control passes run strictly before `iteration`.
    pub fn control_passes_before(&self, iteration: usize) -> usize {
        let end = iteration.min(self.densify_until_iter);
        if end == 0 {
            return 0;
        }
        let k = self.densification_interval;
        ((end - 1) / k).saturating_sub(self.densify_from_iter / k)
    }

    /// Position learning-rate schedule; both endpoints scale with the scene extent.
    pub fn position_lr(&self, scene_extent: f32) -> ExponentialDecayLr {
        ExponentialDecayLr {
            lr_init: self.learning_rates.position * scene_extent,
            lr_final: self.position_lr_final * scene_extent,
            max_steps: self.position_lr_max_steps,
            delay_steps: self.position_lr_delay_steps,
            delay_mult: self.position_lr_delay_mult,
        }
    }

    /// Screen-size pruning bound for the pass at `iteration`, once warm-up is over.
    pub fn max_screen_size_at(&self, iteration: usize) -> Option<f32> {
        (self.control_passes_before(iteration) >= self.screen_size_warmup_passes).then_some(self.max_screen_size)
    }
}
