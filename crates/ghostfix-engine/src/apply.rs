//! Checkpoint-backed patch application
//!
//! The one place a proposed fix touches the working tree. The file about to
//! change is checkpointed first, so every applied fix can be undone through
//! the checkpoint store.

use anyhow::{anyhow, Result};
use ghostfix_adapters::checkpoint::{CheckpointReason, CheckpointStore, CreateOptions};
use ghostfix_adapters::util::{normalize_repo_path, resolve_repo_path_allow_new, write_atomic};
use ghostfix_core::protocol::{ApplyOptions, BoxFuture, PatchApplier};
use ghostfix_core::review::{ApplyResult, ProposedFix};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct CheckpointedApplier {
    root: PathBuf,
    checkpoints: Option<Arc<CheckpointStore>>,
    reason: CheckpointReason,
}

impl CheckpointedApplier {
    /// Applier without a checkpoint store; `create_backup` is ignored.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            checkpoints: None,
            reason: CheckpointReason::ReviewApply,
        }
    }

    pub fn with_checkpoints(store: Arc<CheckpointStore>) -> Self {
        Self {
            root: store.root().to_path_buf(),
            checkpoints: Some(store),
            reason: CheckpointReason::ReviewApply,
        }
    }

    /// Reason recorded on checkpoints this applier takes.
    pub fn reason(mut self, reason: CheckpointReason) -> Self {
        self.reason = reason;
        self
    }

    fn apply_blocking(&self, fix: &ProposedFix, options: ApplyOptions) -> Result<ApplyResult> {
        let relative = normalize_repo_path(&fix.patch.file_path, &self.root);
        let target = resolve_repo_path_allow_new(&self.root, &relative)
            .map_err(|e| anyhow!("Cannot apply fix {}: {}", fix.id, e))?;

        let current = match fs::read_to_string(&target.absolute) {
            Ok(content) => Some(content),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        if let Some(expected) = &fix.patch.original_content {
            if current.as_deref().unwrap_or_default() != expected.as_str() {
                return Ok(ApplyResult::failed(format!(
                    "{} changed since the fix was proposed",
                    target.relative.display()
                )));
            }
        }

        if options.dry_run {
            debug!(fix = %fix.id, path = %target.relative.display(), "dry run; not writing");
            return Ok(ApplyResult {
                success: true,
                files_changed: vec![target.relative],
                dry_run: true,
                ..Default::default()
            });
        }

        let mut checkpoint_id = None;
        if let (true, Some(store), Some(_)) = (options.create_backup, &self.checkpoints, &current) {
            let checkpoint = store.create(
                CreateOptions::new(self.reason)
                    .files([target.relative.clone()])
                    .tag(format!("fix-{}", fix.id)),
            )?;
            checkpoint_id = Some(checkpoint.id);
        }

        if let Some(parent) = target.absolute.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&target.absolute, &fix.patch.new_content)?;

        info!(
            fix = %fix.id,
            path = %target.relative.display(),
            checkpoint = checkpoint_id.as_deref().unwrap_or("none"),
            "fix applied"
        );
        Ok(ApplyResult {
            success: true,
            checkpoint_id,
            files_changed: vec![target.relative],
            error: None,
            dry_run: false,
        })
    }
}

impl PatchApplier for CheckpointedApplier {
    fn apply<'a>(
        &'a self,
        fix: &'a ProposedFix,
        options: ApplyOptions,
    ) -> BoxFuture<'a, Result<ApplyResult>> {
        Box::pin(async move { self.apply_blocking(fix, options) })
    }
}
