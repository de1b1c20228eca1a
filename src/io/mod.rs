//! I/O operations for saving and restoring training state.
//!
//! - Checkpoints (store + optimizer state + scheduler state)

mod checkpoint;

pub use checkpoint::{
    load_checkpoint, read_checkpoint, save_checkpoint, write_checkpoint, Checkpoint, CheckpointError,
};
