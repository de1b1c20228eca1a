//! Optimization components (training loop, losses, density control).
//!
//! This module contains everything needed for training:
//! - Adam optimizer (moments live in the store)
//! - Loss functions (L1, L2)
//! - Adaptive density control (clone/split/prune)
//! - SH degree and learning-rate schedules
//! - Training orchestration

pub mod adam;
pub mod config;
pub mod density;
pub mod loss;
pub mod schedule;
pub mod trainer;

pub use adam::{Adam, AdamConfig, LearningRates};
pub use config::{TrainConfig, TrainPhase};
pub use density::{DensifyConfig, DensifyParams, DensifyReport, DensityController};
pub use loss::LossKind;
pub use schedule::{ConstantLr, ExponentialDecayLr, LrSchedule, ShDegreeSchedule};
pub use trainer::{EvalReport, EvalSet, NoHooks, StepReport, TrainError, TrainView, Trainer, TrainingHooks, ViewSampler};
