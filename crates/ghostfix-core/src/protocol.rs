//! Contracts between the autofix engine and its collaborators
//!
//! Patch generation, test execution and evidence storage live outside this
//! workspace. The engine only sees them through these traits.

use crate::review::{ApplyResult, ProposedFix};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolOperation {
    #[serde(rename = "patch.propose")]
    PatchPropose,
    #[serde(rename = "patch.apply")]
    PatchApply,
    #[serde(rename = "patch.rollback")]
    PatchRollback,
    #[serde(rename = "test.run")]
    TestRun,
}

impl ToolOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolOperation::PatchPropose => "patch.propose",
            ToolOperation::PatchApply => "patch.apply",
            ToolOperation::PatchRollback => "patch.rollback",
            ToolOperation::TestRun => "test.run",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Error text, or a generic message naming the operation.
    pub fn error_text(&self, operation: ToolOperation) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("{} reported failure", operation.as_str()))
    }
}

/// Executes patch and test operations on behalf of the orchestrator.
pub trait ToolExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        operation: ToolOperation,
        payload: Value,
    ) -> BoxFuture<'a, Result<ToolOutcome>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    pub value: Value,
}

/// A recorded verification signal, e.g. "typecheck passed: true"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub run_id: String,
    pub kind: String,
    pub summary: String,
    pub signals: Vec<Signal>,
}

/// Stores verification receipts.
pub trait EvidenceSink: Send + Sync {
    fn store_receipt<'a>(&'a self, receipt: Receipt) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitState {
    pub is_repo: bool,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub dirty: bool,
}

/// Read-only view of the project's git repository.
pub trait GitInspector: Send + Sync {
    fn git_state(&self, root: &Path) -> GitState;

    /// Repo-relative paths of modified, staged and untracked files.
    fn modified_files(&self, root: &Path) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    pub dry_run: bool,
    pub create_backup: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            create_backup: true,
        }
    }
}

/// The checkpoint-backed apply primitive shared by automatic and reviewed fixes.
pub trait PatchApplier: Send + Sync {
    fn apply<'a>(
        &'a self,
        fix: &'a ProposedFix,
        options: ApplyOptions,
    ) -> BoxFuture<'a, Result<ApplyResult>>;
}
