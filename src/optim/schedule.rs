//! Iteration-driven schedules: spherical-harmonics capability and learning rates.

use crate::core::MAX_SH_DEGREE;
use serde::{Deserialize, Serialize};

/// Raises the active SH degree by one every `interval` iterations until
/// `max_degree` is reached. Never decreases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShDegreeSchedule {
    pub interval: usize,
    pub max_degree: usize,
    active: usize,
}

impl ShDegreeSchedule {
    /// `max_degree` is clamped to [`MAX_SH_DEGREE`].
    pub fn new(interval: usize, max_degree: usize) -> Self {
        Self {
            interval,
            max_degree: max_degree.min(MAX_SH_DEGREE),
            active: 0,
        }
    }

    /// Resume from a saved active degree.
    pub fn with_active(mut self, active: usize) -> Self {
        self.active = active.min(self.max_degree);
        self
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// Called once per iteration; returns true when the degree went up.
    pub fn on_iteration(&mut self, iteration: usize) -> bool {
        if self.interval == 0 || iteration == 0 || iteration % self.interval != 0 {
            return false;
        }
        if self.active < self.max_degree {
            self.active += 1;
            tracing::debug!(iteration, degree = self.active, "active SH degree raised");
            return true;
        }
        false
    }
}

/// Learning rate as a function of the iteration.
pub trait LrSchedule {
    fn lr_at(&self, iteration: usize) -> f32;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantLr(pub f32);

impl LrSchedule for ConstantLr {
    fn lr_at(&self, _iteration: usize) -> f32 {
        self.0
    }
}

/// Log-linear interpolation from `lr_init` to `lr_final` over `max_steps`,
/// optionally damped by a sine ramp for the first `delay_steps`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExponentialDecayLr {
    pub lr_init: f32,
    pub lr_final: f32,
    pub max_steps: usize,
    pub delay_steps: usize,
    pub delay_mult: f32,
}

impl ExponentialDecayLr {
    pub fn new(lr_init: f32, lr_final: f32, max_steps: usize) -> Self {
        Self {
            lr_init,
            lr_final,
            max_steps,
            delay_steps: 0,
            delay_mult: 1.0,
        }
    }
}

impl LrSchedule for ExponentialDecayLr {
    fn lr_at(&self, iteration: usize) -> f32 {
        if self.lr_init == 0.0 && self.lr_final == 0.0 {
            return 0.0;
        }
        let delay_rate = if self.delay_steps > 0 {
            let ramp = (iteration as f32 / self.delay_steps as f32).clamp(0.0, 1.0);
            self.delay_mult + (1.0 - self.delay_mult) * (0.5 * std::f32::consts::PI * ramp).sin()
        } else {
            1.0
        };
        let t = (iteration as f32 / self.max_steps.max(1) as f32).clamp(0.0, 1.0);
        let log_lerp = (self.lr_init.ln() * (1.0 - t) + self.lr_final.ln() * t).exp();
        delay_rate * log_lerp
    }
}
