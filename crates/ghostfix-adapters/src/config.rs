//! Configuration management for ghostfix
//!
//! Project settings live in `<root>/.ghostfix/config.json`. When a project has
//! none, `~/.config/ghostfix/config.json` is used, and defaults after that.

use crate::util::write_atomic;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const GHOSTFIX_DIR: &str = ".ghostfix";
const CONFIG_FILE: &str = "config.json";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Auto-prune keeps at most this many checkpoints
    pub max_checkpoints: usize,
    /// Auto-prune trims oldest checkpoints until recorded sizes fit
    pub max_total_bytes: u64,
    pub auto_prune: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: 50,
            max_total_bytes: 500 * MIB,
            auto_prune: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofixSettings {
    /// Patches scoring above this need approval
    pub auto_approve_threshold: u8,
    pub max_attempts: u32,
    pub max_iterations: u32,
    /// Apply-level retries per patch
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for AutofixSettings {
    fn default() -> Self {
        Self {
            auto_approve_threshold: 40,
            max_attempts: 3,
            max_iterations: 100,
            max_retries: 2,
            retry_base_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSettings {
    pub max_queue_size: usize,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_concurrent: 4,
            max_retries: 2,
            retry_base_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GhostfixConfig {
    pub checkpoint: CheckpointConfig,
    pub autofix: AutofixSettings,
    pub review: ReviewSettings,
}

impl GhostfixConfig {
    fn sanitize(&mut self) {
        self.checkpoint.max_checkpoints = self.checkpoint.max_checkpoints.max(1);
        self.checkpoint.max_total_bytes = self.checkpoint.max_total_bytes.max(MIB);
        self.autofix.auto_approve_threshold = self.autofix.auto_approve_threshold.min(100);
        self.autofix.max_attempts = self.autofix.max_attempts.clamp(1, 10);
        self.autofix.max_iterations = self.autofix.max_iterations.clamp(1, 1_000);
        self.autofix.max_retries = self.autofix.max_retries.min(10);
        self.review.max_queue_size = self.review.max_queue_size.max(1);
        self.review.max_concurrent = self.review.max_concurrent.clamp(1, 64);
        self.review.max_retries = self.review.max_retries.min(10);
    }

    /// Project config path
    pub fn project_path(root: &Path) -> PathBuf {
        root.join(GHOSTFIX_DIR).join(CONFIG_FILE)
    }

    /// Get the user-level config file path
    fn user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ghostfix").join(CONFIG_FILE))
    }

    /// Load project config, then user config, or return defaults
    pub fn load(root: &Path) -> Self {
        let candidates = std::iter::once(Self::project_path(root)).chain(Self::user_path());
        for path in candidates {
            if let Some(config) = Self::load_from(&path) {
                return config;
            }
        }
        Self::default()
    }

    fn load_from(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str::<GhostfixConfig>(&content) {
            Ok(mut config) => {
                config.sanitize();
                Some(config)
            }
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                None
            }
        }
    }

    /// Save config to the project directory
    pub fn save(&self, root: &Path) -> anyhow::Result<()> {
        let mut sanitized = self.clone();
        sanitized.sanitize();
        let path = Self::project_path(root);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(&sanitized)?;
        write_atomic(&path, &content)
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let backup = path.with_extension("json.corrupt");
    let _ = fs::write(backup, content);
}
