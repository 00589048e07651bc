//! Proposed fixes and the records the review queue keeps for them

use crate::finding::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The defect a proposed fix addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixIssue {
    /// Finding type, e.g. `ghost-import`
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default = "default_issue_severity")]
    pub severity: Severity,
}

fn default_issue_severity() -> Severity {
    Severity::Medium
}

/// The concrete change a fix makes to one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixPatch {
    pub file_path: PathBuf,
    /// Content the file is expected to have before the change. A mismatch at
    /// apply time is treated as a conflict.
    #[serde(default)]
    pub original_content: Option<String>,
    pub new_content: String,
    /// Unified diff for display
    #[serde(default)]
    pub diff: Option<String>,
}

impl FixPatch {
    /// Count of `+`/`-` lines in the diff, ignoring file headers.
    pub fn changed_lines(&self) -> usize {
        let Some(diff) = &self.diff else {
            return 0;
        };
        diff.lines()
            .filter(|line| {
                (line.starts_with('+') && !line.starts_with("+++"))
                    || (line.starts_with('-') && !line.starts_with("---"))
            })
            .count()
    }
}

/// A fix produced upstream, awaiting application or review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedFix {
    pub id: String,
    pub issue: FixIssue,
    pub patch: FixPatch,
    /// Confidence in `[0, 1]`
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
}

/// A fix upstream refused to apply or queue, with the reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedFix {
    pub fix: ProposedFix,
    pub reason: String,
}

/// Output of an upstream fix run, partitioned by what should happen next
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixResult {
    #[serde(default)]
    pub auto_applied: Vec<ProposedFix>,
    #[serde(default)]
    pub suggested: Vec<ProposedFix>,
    #[serde(default)]
    pub rejected: Vec<RejectedFix>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Applied,
    Failed,
    Skipped,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Applied => "applied",
            ReviewStatus::Failed => "failed",
            ReviewStatus::Skipped => "skipped",
        }
    }

    /// A human (or batch apply) has acted on the item.
    pub fn is_decided(&self) -> bool {
        !matches!(self, ReviewStatus::Pending)
    }
}

/// Result of one checkpoint-backed apply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub success: bool,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl ApplyResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Same as the fix id
    pub id: String,
    pub fix: ProposedFix,
    pub status: ReviewStatus,
    /// Monotonic insertion counter; lower means queued earlier
    pub sequence: u64,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub apply_result: Option<ApplyResult>,
    #[serde(default)]
    pub retry_count: u32,
}

impl ReviewItem {
    pub fn new(fix: ProposedFix, sequence: u64) -> Self {
        Self {
            id: fix.id.clone(),
            fix,
            status: ReviewStatus::Pending,
            sequence,
            queued_at: Utc::now(),
            reviewed_at: None,
            reviewer: None,
            comment: None,
            applied_at: None,
            apply_result: None,
            retry_count: 0,
        }
    }
}
