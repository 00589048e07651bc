//! Runtime adapters for ghostfix (checkpoints, git, config, persistence).

pub mod checkpoint;
pub mod config;
pub mod git_ops;
pub mod session;
pub mod util;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointReason, CheckpointStore, CreateOptions, PruneOptions,
    RestoreOptions,
};
pub use config::GhostfixConfig;
