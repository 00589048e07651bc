//! Persistence for autofix runs suspended at the approval gate
//!
//! A run that stops in `AwaitingApproval` is written to
//! `<root>/.ghostfix/sessions/<run_id>.json` so a later process can load it and
//! resume with the reviewer's decision.

use crate::config::GHOSTFIX_DIR;
use crate::util::write_atomic;
use anyhow::{Context, Result};
use ghostfix_core::state::{AutoFixState, Node};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SESSIONS_DIR: &str = "sessions";

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            dir: project_root.join(GHOSTFIX_DIR).join(SESSIONS_DIR),
        }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    pub fn save(&self, state: &AutoFixState) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(&state.run_id);
        let content = serde_json::to_string_pretty(state)?;
        write_atomic(&path, &content)?;
        debug!(run = %state.run_id, node = %state.node, "saved autofix session");
        Ok(path)
    }

    pub fn load(&self, run_id: &str) -> Result<AutoFixState> {
        let path = self.path_for(run_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("No saved session at {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Saved session {} is corrupt", path.display()))
    }

    /// Run ids of saved sessions still waiting for a decision, sorted.
    pub fn pending(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(run_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(state) = self.load(run_id) {
                if state.node == Node::AwaitingApproval {
                    ids.push(run_id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn remove(&self, run_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(run_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
