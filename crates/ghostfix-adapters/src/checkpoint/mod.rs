//! Content-addressed checkpoint store
//!
//! Every automated change is preceded by a checkpoint: a copy of the files
//! about to change plus a manifest of their content hashes. Restoring a
//! checkpoint puts those bytes back.
//!
//! Layout under the project root:
//!
//! ```text
//! .ghostfix/checkpoints/
//!   index.json                 one summary row per checkpoint
//!   <id>/manifest.json         full manifest, never rewritten
//!   <id>/files/<relative path> backed-up file contents
//! ```
//!
//! File I/O is sequential and takes no lock on the working tree. Callers must
//! not run two checkpoint operations against the same project at once; the
//! index lock only keeps `index.json` itself consistent.

use crate::config::{CheckpointConfig, GHOSTFIX_DIR};
use crate::git_ops::Git2Inspector;
use crate::util::{hash_bytes, normalize_repo_path, resolve_repo_path_allow_new, sanitize_tag, write_atomic};
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use ghostfix_core::protocol::GitInspector;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

const CHECKPOINTS_DIR: &str = "checkpoints";
const INDEX_FILE: &str = "index.json";
const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";
const INDEX_LOCK_FILE: &str = ".lock";
const INDEX_VERSION: u32 = 1;
const INDEX_LOCK_TIMEOUT_SECS: u64 = 5;
const INDEX_LOCK_RETRY_MS: u64 = 50;

/// Cap on files picked up by the fallback directory walk
pub const MAX_WALK_FILES: usize = 100;

pub const LATEST_ALIAS: &str = "latest";

const SOURCE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "vue", "svelte", "json", "rs", "py", "go", "java",
    "kt", "rb", "php", "cs", "css", "scss", "html", "yaml", "yml", "toml", "prisma", "graphql",
    "sql", "md",
];

const SKIP_DIRS: &[&str] = &[
    ".git",
    GHOSTFIX_DIR,
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".nuxt",
    ".turbo",
    "coverage",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
];

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Checkpoint id prefix '{prefix}' matches {count} checkpoints")]
    Ambiguous { prefix: String, count: usize },

    #[error("No files to checkpoint")]
    NoFilesToCheckpoint,

    #[error("Project root does not exist: {}", .0.display())]
    MissingProjectRoot(PathBuf),

    #[error("Path escapes project root: {0}")]
    PathEscapesRoot(String),

    #[error("Timed out waiting for checkpoint index lock ({0}s)")]
    LockTimeout(u64),

    #[error("Checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint data is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CheckpointError {
    /// What the user can do about it.
    pub fn hint(&self) -> &'static str {
        match self {
            CheckpointError::NotFound(_) => {
                "List checkpoints to see available ids, or use `latest`."
            }
            CheckpointError::Ambiguous { .. } => {
                "Use a longer id prefix or the full checkpoint id."
            }
            CheckpointError::NoFilesToCheckpoint => {
                "Pass the files to back up explicitly, or check the project contains source files."
            }
            CheckpointError::MissingProjectRoot(_) => {
                "Check the project path exists and is a directory."
            }
            CheckpointError::PathEscapesRoot(_) => {
                "The manifest may have been edited by hand; restore individual files instead."
            }
            CheckpointError::LockTimeout(_) => {
                "Another ghostfix process may be writing checkpoints; retry shortly."
            }
            CheckpointError::Io(_) => "Check permissions on the .ghostfix directory.",
            CheckpointError::Serialization(_) => {
                "The checkpoint index or manifest is corrupt; delete the affected checkpoint."
            }
        }
    }
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Why a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Manual,
    Autofix,
    ReviewApply,
    BeforeRestore,
    Command,
    AutoSave,
}

impl CheckpointReason {
    pub fn label(&self) -> &'static str {
        match self {
            CheckpointReason::Manual => "manual",
            CheckpointReason::Autofix => "autofix",
            CheckpointReason::ReviewApply => "review apply",
            CheckpointReason::BeforeRestore => "before restore",
            CheckpointReason::Command => "command",
            CheckpointReason::AutoSave => "auto save",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Repo-relative path
    pub path: PathBuf,
    /// Truncated SHA-256 of the backed-up content
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub git_dirty: bool,
    pub total_size: u64,
    /// Command that triggered the checkpoint, if any
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub reason: CheckpointReason,
    #[serde(default)]
    pub tag: Option<String>,
    pub files: Vec<CheckpointFile>,
    pub metadata: CheckpointMetadata,
}

/// Summary row kept in `index.json` for listing without reading manifests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub reason: CheckpointReason,
    #[serde(default)]
    pub tag: Option<String>,
    pub file_count: usize,
    pub total_size: u64,
}

impl From<&Checkpoint> for IndexEntry {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            id: cp.id.clone(),
            timestamp: cp.timestamp,
            reason: cp.reason,
            tag: cp.tag.clone(),
            file_count: cp.files.len(),
            total_size: cp.metadata.total_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointIndex {
    version: u32,
    /// Append order; newest last
    checkpoints: Vec<IndexEntry>,
}

impl Default for CheckpointIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            checkpoints: Vec::new(),
        }
    }
}

impl CheckpointIndex {
    /// Entries newest first.
    fn newest_first(&self) -> Vec<IndexEntry> {
        let mut entries = self.checkpoints.clone();
        entries.reverse();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries
    }
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Files to back up. `None` picks git-modified files, then a directory walk.
    pub files: Option<Vec<PathBuf>>,
    pub reason: CheckpointReason,
    pub tag: Option<String>,
    pub command: Option<String>,
}

impl CreateOptions {
    pub fn new(reason: CheckpointReason) -> Self {
        Self {
            files: None,
            reason,
            tag: None,
            command: None,
        }
    }

    pub fn files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub only_files: Option<Vec<PathBuf>>,
    pub dry_run: bool,
    /// Checkpoint the current state first so the restore can itself be undone
    pub backup_first: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            only_files: None,
            dry_run: false,
            backup_first: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub checkpoint_id: String,
    pub restored: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub backup_id: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointDiff {
    pub checkpoint_id: String,
    pub changed: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
}

impl CheckpointDiff {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty() || !self.deleted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOptions {
    /// Keep this many most recent checkpoints
    pub keep: Option<usize>,
    /// Keep checkpoints newer than this many days
    pub older_than_days: Option<i64>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub freed_bytes: u64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointStats {
    pub count: usize,
    pub total_bytes: u64,
}

pub struct CheckpointStore {
    root: PathBuf,
    dir: PathBuf,
    config: CheckpointConfig,
    git: Arc<dyn GitInspector>,
}

struct IndexLock {
    file: fs::File,
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl CheckpointStore {
    /// Open the store for a project. The root must exist.
    pub fn open(project_root: &Path, config: CheckpointConfig) -> CheckpointResult<Self> {
        if !project_root.is_dir() {
            return Err(CheckpointError::MissingProjectRoot(project_root.to_path_buf()));
        }
        let root = project_root.canonicalize()?;
        let dir = root.join(GHOSTFIX_DIR).join(CHECKPOINTS_DIR);
        Ok(Self {
            root,
            dir,
            config,
            git: Arc::new(Git2Inspector),
        })
    }

    pub fn with_git(mut self, git: Arc<dyn GitInspector>) -> Self {
        self.git = git;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn checkpoint_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn stored_file(&self, id: &str, relative: &Path) -> PathBuf {
        self.checkpoint_dir(id).join(FILES_DIR).join(relative)
    }

    // ── create ──────────────────────────────────────────────────────────

    pub fn create(&self, options: CreateOptions) -> CheckpointResult<Checkpoint> {
        let checkpoint = self.write_checkpoint(options)?;
        if self.config.auto_prune {
            self.enforce_limits(&[checkpoint.id.as_str()])?;
        }
        Ok(checkpoint)
    }

    /// Store and index a checkpoint without pruning. A failure part way
    /// through removes the partial checkpoint directory.
    fn write_checkpoint(&self, options: CreateOptions) -> CheckpointResult<Checkpoint> {
        let candidates = self.resolve_files(options.files.as_deref())?;
        if candidates.is_empty() {
            return Err(CheckpointError::NoFilesToCheckpoint);
        }

        let timestamp = Utc::now();
        let id = new_checkpoint_id(timestamp, options.tag.as_deref());
        let cp_dir = self.checkpoint_dir(&id);
        let files = match self.store_files(&id, candidates) {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => {
                let _ = fs::remove_dir_all(&cp_dir);
                return Err(CheckpointError::NoFilesToCheckpoint);
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&cp_dir);
                return Err(err);
            }
        };

        let git = self.git.git_state(&self.root);
        let total_size = files.iter().map(|f| f.size).sum();
        let checkpoint = Checkpoint {
            id: id.clone(),
            timestamp,
            reason: options.reason,
            tag: options.tag.filter(|t| !t.trim().is_empty()),
            files,
            metadata: CheckpointMetadata {
                git_branch: git.branch,
                git_commit: git.commit,
                git_dirty: git.dirty,
                total_size,
                command: options.command,
            },
        };

        let manifest = serde_json::to_string_pretty(&checkpoint)?;
        if let Err(err) = write_atomic(&cp_dir.join(MANIFEST_FILE), &manifest) {
            let _ = fs::remove_dir_all(&cp_dir);
            return Err(into_io(err));
        }
        self.update_index(|index| index.checkpoints.push(IndexEntry::from(&checkpoint)))?;

        info!(
            checkpoint = %checkpoint.id,
            reason = checkpoint.reason.label(),
            files = checkpoint.files.len(),
            bytes = total_size,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    fn store_files(&self, id: &str, candidates: Vec<PathBuf>) -> CheckpointResult<Vec<CheckpointFile>> {
        fs::create_dir_all(self.checkpoint_dir(id).join(FILES_DIR))?;
        let mut files = Vec::with_capacity(candidates.len());
        for relative in candidates {
            let source = self.root.join(&relative);
            let content = match fs::read(&source) {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %relative.display(), error = %err, "skipping unreadable file");
                    continue;
                }
            };
            let target = self.stored_file(id, &relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &content)?;
            files.push(CheckpointFile {
                path: relative,
                hash: hash_bytes(&content),
                size: content.len() as u64,
            });
        }
        Ok(files)
    }

    fn resolve_files(&self, explicit: Option<&[PathBuf]>) -> CheckpointResult<Vec<PathBuf>> {
        if let Some(explicit) = explicit {
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for path in explicit {
                let relative = normalize_repo_path(path, &self.root);
                let resolved = resolve_repo_path_allow_new(&self.root, &relative)
                    .map_err(CheckpointError::PathEscapesRoot)?;
                if is_tool_path(&resolved.relative) || !resolved.absolute.is_file() {
                    debug!(path = %relative.display(), "not a backup candidate");
                    continue;
                }
                if seen.insert(resolved.relative.clone()) {
                    out.push(resolved.relative);
                }
            }
            return Ok(out);
        }

        if self.git.git_state(&self.root).is_repo {
            match self.git.modified_files(&self.root) {
                Ok(files) => {
                    let existing: Vec<PathBuf> = files
                        .into_iter()
                        .filter(|f| !is_tool_path(f) && self.root.join(f).is_file())
                        .collect();
                    if !existing.is_empty() {
                        return Ok(existing);
                    }
                }
                Err(err) => warn!(error = %err, "could not list git changes; walking the tree"),
            }
        }

        Ok(self.walk_source_files())
    }

    fn walk_source_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry))
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && has_source_extension(entry.path()))
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(Path::to_path_buf)
            })
            .take(MAX_WALK_FILES)
            .collect()
    }

    // ── restore / diff ─────────────────────────────────────────────────

    pub fn restore(&self, id_or_alias: &str, options: RestoreOptions) -> CheckpointResult<RestoreReport> {
        let checkpoint = self.get(id_or_alias)?;

        let mut report = RestoreReport {
            checkpoint_id: checkpoint.id.clone(),
            dry_run: options.dry_run,
            ..Default::default()
        };

        let targets: Vec<&CheckpointFile> = match &options.only_files {
            Some(only) => {
                let wanted: HashSet<PathBuf> = only
                    .iter()
                    .map(|p| normalize_repo_path(p, &self.root))
                    .collect();
                let recorded: HashSet<&PathBuf> = checkpoint.files.iter().map(|f| &f.path).collect();
                for path in &wanted {
                    if !recorded.contains(path) {
                        report.skipped.push(path.clone());
                    }
                }
                report.skipped.sort();
                checkpoint
                    .files
                    .iter()
                    .filter(|f| wanted.contains(&f.path))
                    .collect()
            }
            None => checkpoint.files.iter().collect(),
        };

        // Validate every destination before touching anything.
        let mut plan = Vec::with_capacity(targets.len());
        for file in targets {
            let destination = resolve_repo_path_allow_new(&self.root, &file.path)
                .map_err(CheckpointError::PathEscapesRoot)?;
            let stored = self.stored_file(&checkpoint.id, &file.path);
            if stored.is_file() {
                plan.push((file.path.clone(), stored, destination.absolute));
            } else {
                warn!(path = %file.path.display(), "stored content missing; skipping");
                report.skipped.push(file.path.clone());
            }
        }

        if options.dry_run {
            report.restored = plan.into_iter().map(|(path, _, _)| path).collect();
            return Ok(report);
        }

        // Auto-prune waits until the copy is done and spares the checkpoint
        // being restored.
        if options.backup_first {
            let current: Vec<PathBuf> = plan
                .iter()
                .filter(|(_, _, dest)| dest.is_file())
                .map(|(path, _, _)| path.clone())
                .collect();
            if !current.is_empty() {
                let backup = self.write_checkpoint(
                    CreateOptions::new(CheckpointReason::BeforeRestore)
                        .files(current)
                        .tag(format!("before-restore-{}", checkpoint.id)),
                )?;
                report.backup_id = Some(backup.id);
            }
        }

        for (path, stored, destination) in plan {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&stored, &destination)?;
            report.restored.push(path);
        }

        if self.config.auto_prune {
            if let Some(backup_id) = &report.backup_id {
                self.enforce_limits(&[backup_id.as_str(), checkpoint.id.as_str()])?;
            }
        }

        info!(
            checkpoint = %checkpoint.id,
            restored = report.restored.len(),
            skipped = report.skipped.len(),
            "checkpoint restored"
        );
        Ok(report)
    }

    /// Compare recorded hashes with the working tree. Files created after the
    /// checkpoint outside its scope are not reported.
    pub fn diff(&self, id_or_alias: &str) -> CheckpointResult<CheckpointDiff> {
        let checkpoint = self.get(id_or_alias)?;
        let mut diff = CheckpointDiff {
            checkpoint_id: checkpoint.id.clone(),
            ..Default::default()
        };
        for file in &checkpoint.files {
            let current = self.root.join(&file.path);
            if !current.exists() {
                diff.deleted.push(file.path.clone());
                continue;
            }
            match fs::read(&current) {
                Ok(content) if hash_bytes(&content) == file.hash => {
                    diff.unchanged.push(file.path.clone())
                }
                _ => diff.changed.push(file.path.clone()),
            }
        }
        Ok(diff)
    }

    // ── lookup ─────────────────────────────────────────────────────────

    /// Index entries, newest first.
    pub fn list(&self) -> CheckpointResult<Vec<IndexEntry>> {
        Ok(self.load_index()?.newest_first())
    }

    /// Resolve `latest`, an exact id, a tag, or a unique id prefix.
    pub fn resolve(&self, id_or_alias: &str) -> CheckpointResult<String> {
        let needle = id_or_alias.trim();
        let entries = self.list()?;

        if needle == LATEST_ALIAS {
            return entries
                .first()
                .map(|e| e.id.clone())
                .ok_or_else(|| CheckpointError::NotFound(needle.to_string()));
        }
        if let Some(entry) = entries.iter().find(|e| e.id == needle) {
            return Ok(entry.id.clone());
        }
        if let Some(entry) = entries.iter().find(|e| e.tag.as_deref() == Some(needle)) {
            return Ok(entry.id.clone());
        }

        let matches: Vec<&IndexEntry> = if needle.is_empty() {
            Vec::new()
        } else {
            entries.iter().filter(|e| e.id.starts_with(needle)).collect()
        };
        match matches.as_slice() {
            [only] => Ok(only.id.clone()),
            [] => Err(CheckpointError::NotFound(needle.to_string())),
            many => Err(CheckpointError::Ambiguous {
                prefix: needle.to_string(),
                count: many.len(),
            }),
        }
    }

    pub fn get(&self, id_or_alias: &str) -> CheckpointResult<Checkpoint> {
        let id = self.resolve(id_or_alias)?;
        let path = self.checkpoint_dir(&id).join(MANIFEST_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(id));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    pub fn get_latest(&self) -> CheckpointResult<Option<Checkpoint>> {
        match self.get(LATEST_ALIAS) {
            Ok(cp) => Ok(Some(cp)),
            Err(CheckpointError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn stats(&self) -> CheckpointResult<CheckpointStats> {
        let index = self.load_index()?;
        Ok(CheckpointStats {
            count: index.checkpoints.len(),
            total_bytes: index.checkpoints.iter().map(|e| e.total_size).sum(),
        })
    }

    // ── delete / prune ─────────────────────────────────────────────────

    pub fn delete(&self, id_or_alias: &str) -> CheckpointResult<IndexEntry> {
        let id = self.resolve(id_or_alias)?;
        let mut removed = None;
        self.update_index(|index| {
            if let Some(pos) = index.checkpoints.iter().position(|e| e.id == id) {
                removed = Some(index.checkpoints.remove(pos));
            }
        })?;
        self.remove_checkpoint_dir(&id)?;
        removed.ok_or(CheckpointError::NotFound(id))
    }

    /// Keep the `keep` most recent checkpoints and/or those newer than
    /// `older_than_days`; delete the rest. With neither set nothing is deleted.
    pub fn prune(&self, options: PruneOptions) -> CheckpointResult<PruneReport> {
        if options.keep.is_none() && options.older_than_days.is_none() {
            return Ok(PruneReport {
                dry_run: options.dry_run,
                ..Default::default()
            });
        }

        let cutoff = options
            .older_than_days
            .map(|days| Utc::now() - Duration::days(days.max(0)));
        let doomed: Vec<IndexEntry> = self
            .list()?
            .into_iter()
            .enumerate()
            .filter(|(rank, entry)| {
                let kept_by_count = options.keep.is_some_and(|keep| *rank < keep);
                let kept_by_age = cutoff.is_some_and(|cutoff| entry.timestamp > cutoff);
                !(kept_by_count || kept_by_age)
            })
            .map(|(_, entry)| entry)
            .collect();

        self.delete_entries(doomed, options.dry_run)
    }

    fn delete_entries(&self, doomed: Vec<IndexEntry>, dry_run: bool) -> CheckpointResult<PruneReport> {
        let report = PruneReport {
            deleted: doomed.iter().map(|e| e.id.clone()).collect(),
            freed_bytes: doomed.iter().map(|e| e.total_size).sum(),
            dry_run,
        };
        if dry_run || doomed.is_empty() {
            return Ok(report);
        }

        let ids: HashSet<&str> = doomed.iter().map(|e| e.id.as_str()).collect();
        self.update_index(|index| index.checkpoints.retain(|e| !ids.contains(e.id.as_str())))?;
        for id in &report.deleted {
            self.remove_checkpoint_dir(id)?;
        }
        info!(
            deleted = report.deleted.len(),
            freed_bytes = report.freed_bytes,
            "checkpoints pruned"
        );
        Ok(report)
    }

    /// Drop oldest checkpoints until count and byte limits hold. Ids in
    /// `protect` are never removed.
    fn enforce_limits(&self, protect: &[&str]) -> CheckpointResult<()> {
        let entries = self.list()?;
        let mut count = entries.len();
        let mut total: u64 = entries.iter().map(|e| e.total_size).sum();
        if count <= self.config.max_checkpoints && total <= self.config.max_total_bytes {
            return Ok(());
        }

        let mut doomed = Vec::new();
        for entry in entries.into_iter().rev() {
            if count <= self.config.max_checkpoints && total <= self.config.max_total_bytes {
                break;
            }
            if protect.contains(&entry.id.as_str()) {
                continue;
            }
            count -= 1;
            total = total.saturating_sub(entry.total_size);
            doomed.push(entry);
        }
        let report = self.delete_entries(doomed, false)?;
        if !report.deleted.is_empty() {
            debug!(deleted = report.deleted.len(), "auto-pruned checkpoints");
        }
        Ok(())
    }

    fn remove_checkpoint_dir(&self, id: &str) -> CheckpointResult<()> {
        match fs::remove_dir_all(self.checkpoint_dir(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // ── index ──────────────────────────────────────────────────────────

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn load_index(&self) -> CheckpointResult<CheckpointIndex> {
        match fs::read_to_string(self.index_path()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(CheckpointIndex::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn update_index<F>(&self, mutate: F) -> CheckpointResult<()>
    where
        F: FnOnce(&mut CheckpointIndex),
    {
        let _lock = self.lock_index()?;
        let mut index = self.load_index()?;
        mutate(&mut index);
        index.version = INDEX_VERSION;
        let content = serde_json::to_string_pretty(&index)?;
        write_atomic(&self.index_path(), &content).map_err(into_io)
    }

    fn lock_index(&self) -> CheckpointResult<IndexLock> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(INDEX_LOCK_FILE))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(IndexLock { file }),
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= StdDuration::from_secs(INDEX_LOCK_TIMEOUT_SECS) {
                        return Err(CheckpointError::LockTimeout(INDEX_LOCK_TIMEOUT_SECS));
                    }
                    std::thread::sleep(StdDuration::from_millis(INDEX_LOCK_RETRY_MS));
                }
            }
        }
    }
}

/// `CP_<YYYYMMDDHHMMSS>_<8 hex>[_<tag>]`
pub fn new_checkpoint_id(timestamp: DateTime<Utc>, tag: Option<&str>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    let mut id = format!("CP_{}_{}", timestamp.format("%Y%m%d%H%M%S"), &random[..8]);
    if let Some(tag) = tag.map(sanitize_tag).filter(|t| !t.is_empty()) {
        id.push('_');
        id.push_str(&tag);
    }
    id
}

fn into_io(err: anyhow::Error) -> CheckpointError {
    match err.downcast::<std::io::Error>() {
        Ok(io) => CheckpointError::Io(io),
        Err(other) => CheckpointError::Io(std::io::Error::other(other.to_string())),
    }
}

fn is_tool_path(relative: &Path) -> bool {
    relative
        .components()
        .next()
        .is_some_and(|c| c.as_os_str() == GHOSTFIX_DIR)
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests;
