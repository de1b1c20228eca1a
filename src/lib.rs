//! # densify-rs: Adaptive density control for Gaussian Splatting
//!
//! This crate trains a 3D Gaussian Splatting scene and keeps the primitive
//! population adapted to the reconstruction error while it does so: primitives
//! in under-reconstructed regions are cloned or split, transparent and
//! oversized ones are pruned, and opacities are periodically reset.
//!
//! ## Architecture
//!
//! The crate is organized into several modules:
//!
//! - `core`: Fundamental data structures (Gaussians, cameras, math utilities)
//! - `store`: The primitive store and everything row-aligned with it
//!   (gradients, densification statistics, Adam moments)
//! - `optim`: Optimization (Adam, losses, density control, schedules, trainer)
//! - `render`: Rasterizer contract plus a small CPU rasterizer
//! - `io`: Checkpoints
//!
//! ## Invariant
//!
//! Every per-primitive array has the same length N. Only
//! `GaussianStore::append` and `GaussianStore::select_and_compact` change N,
//! and they resize attributes, statistics and optimizer state in one call.

// Core data structures and math
pub mod core;

// Primitive store and row-aligned state
pub mod store;

// Optimization (training loop, density control, etc.)
pub mod optim;

// Rasterizer contract
pub mod render;

// Checkpoints
pub mod io;

// Re-export commonly used types at crate root for convenience
pub use core::{Camera, Gaussian};
pub use optim::{TrainConfig, Trainer};
pub use store::{GaussianStore, StoreError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
