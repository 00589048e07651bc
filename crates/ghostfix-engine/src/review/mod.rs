//! Human review queue for fixes that were not auto-approved
//!
//! Fixes wait here as `pending` items until someone approves, rejects or
//! skips them. Approved items are applied in sequential batches; items in a
//! batch apply concurrently through the checkpoint-backed [`PatchApplier`] and
//! each is retried on its own.

mod format;

pub use format::{pr_comment, render, ReviewFormat};

use crate::retry::{with_backoff, RetryPolicy};
use chrono::Utc;
use futures::future::join_all;
use ghostfix_adapters::config::ReviewSettings;
use ghostfix_core::protocol::{ApplyOptions, PatchApplier};
use ghostfix_core::review::{ApplyResult, FixResult, ProposedFix, RejectedFix, ReviewItem, ReviewStatus};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReviewError {
    #[error("Invalid fix: {0}")]
    InvalidFix(String),

    #[error("Review queue is full ({max} items) and none are pending")]
    QueueFull { max: usize },

    #[error("Approved fixes are already being applied")]
    AlreadyApplying,

    #[error("No review item with id {0}")]
    NotFound(String),
}

/// What `process` did with each fix of an upstream result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub auto_applied: Vec<String>,
    pub queued: Vec<String>,
    pub rejected: Vec<String>,
    /// One line per fix that could not be queued
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApplyApprovedOptions {
    pub dry_run: bool,
    /// Checkpoint each file before writing it
    pub create_backup: bool,
    /// Overrides the configured batch width
    pub max_concurrent: Option<usize>,
    /// Overrides the configured per-item retries
    pub max_retries: Option<u32>,
    pub stop_on_first_failure: bool,
}

impl Default for ApplyApprovedOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            create_backup: true,
            max_concurrent: None,
            max_retries: None,
            stop_on_first_failure: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Size of each batch issued, in order
    pub batches: Vec<usize>,
    pub applied: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReviewFilter {
    pub status: Option<ReviewStatus>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub issue_type: Option<String>,
    /// Substring of the patched file path
    pub path_contains: Option<String>,
}

impl ReviewFilter {
    fn matches(&self, item: &ReviewItem) -> bool {
        if self.status.is_some_and(|status| item.status != status) {
            return false;
        }
        let confidence = item.fix.confidence;
        if self.min_confidence.is_some_and(|min| confidence < min)
            || self.max_confidence.is_some_and(|max| confidence > max)
        {
            return false;
        }
        if let Some(kind) = &self.issue_type {
            if &item.fix.issue.kind != kind {
                return false;
            }
        }
        if let Some(needle) = &self.path_contains {
            if !item.fix.patch.file_path.to_string_lossy().contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReviewSummary {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Age of the oldest pending item in seconds
    pub oldest_pending_secs: Option<i64>,
}

#[derive(Default)]
struct ReviewQueue {
    /// Insertion order
    items: Vec<ReviewItem>,
    next_sequence: u64,
    rejections: Vec<RejectedFix>,
}

impl ReviewQueue {
    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ReviewItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn oldest_pending(&self) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == ReviewStatus::Pending)
            .min_by_key(|(_, item)| item.sequence)
            .map(|(pos, _)| pos)
    }

    fn unique_resubmission_id(&self, id: &str) -> String {
        let base = format!("{}-{}", id, Utc::now().timestamp_millis());
        let mut candidate = base.clone();
        let mut n = 1;
        while self.position(&candidate).is_some() {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        candidate
    }
}

pub struct ReviewPipeline {
    applier: Arc<dyn PatchApplier>,
    settings: ReviewSettings,
    queue: Mutex<ReviewQueue>,
    applying: tokio::sync::Mutex<()>,
}

fn validate(fix: &ProposedFix) -> Result<(), ReviewError> {
    if fix.id.trim().is_empty() {
        return Err(ReviewError::InvalidFix("fix has no id".to_string()));
    }
    if fix.issue.kind.trim().is_empty() {
        return Err(ReviewError::InvalidFix(format!("fix {} has no issue type", fix.id)));
    }
    if fix.patch.file_path.as_os_str().is_empty() {
        return Err(ReviewError::InvalidFix(format!("fix {} has no patch file path", fix.id)));
    }
    Ok(())
}

enum Decision {
    Approve,
    Reject,
    Skip,
}

impl Decision {
    fn status(&self) -> ReviewStatus {
        match self {
            Decision::Approve => ReviewStatus::Approved,
            Decision::Reject => ReviewStatus::Rejected,
            Decision::Skip => ReviewStatus::Skipped,
        }
    }
}

impl ReviewPipeline {
    pub fn new(applier: Arc<dyn PatchApplier>, settings: ReviewSettings) -> Self {
        Self {
            applier,
            settings,
            queue: Mutex::new(ReviewQueue::default()),
            applying: tokio::sync::Mutex::new(()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, ReviewQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route an upstream fix result: auto-applied ids pass through, suggested
    /// fixes are queued, rejected fixes are recorded. One bad fix never stops
    /// the rest.
    pub fn process(&self, result: FixResult) -> ProcessReport {
        let mut report = ProcessReport {
            auto_applied: result.auto_applied.iter().map(|f| f.id.clone()).collect(),
            ..Default::default()
        };

        for fix in result.suggested {
            let id = fix.id.clone();
            match self.add_to_queue(fix) {
                Ok(queued_id) => report.queued.push(queued_id),
                Err(err) => report.errors.push(format!("{}: {}", id, err)),
            }
        }

        let mut queue = self.queue();
        for rejected in result.rejected {
            report.rejected.push(rejected.fix.id.clone());
            queue.rejections.push(rejected);
        }
        // Rejection records share the queue bound; the oldest go first.
        let max = self.settings.max_queue_size.max(1);
        if queue.rejections.len() > max {
            let excess = queue.rejections.len() - max;
            queue.rejections.drain(..excess);
            debug!(dropped = excess, "trimmed rejection records");
        }
        report
    }

    /// Queue a fix for review and return the id it was queued under.
    pub fn add_to_queue(&self, mut fix: ProposedFix) -> Result<String, ReviewError> {
        validate(&fix)?;
        let mut queue = self.queue();

        if let Some(pos) = queue.position(&fix.id) {
            if queue.items[pos].status == ReviewStatus::Pending {
                debug!(fix = %fix.id, "replacing pending fix");
                queue.items[pos].fix = fix;
                return Ok(queue.items[pos].id.clone());
            }
            let new_id = queue.unique_resubmission_id(&fix.id);
            debug!(fix = %fix.id, new_id = %new_id, "fix already decided; queueing under a new id");
            fix.id = new_id;
        }

        let max = self.settings.max_queue_size.max(1);
        if queue.items.len() >= max {
            let Some(evict) = queue.oldest_pending() else {
                return Err(ReviewError::QueueFull { max });
            };
            let evicted = queue.items.remove(evict);
            warn!(evicted = %evicted.id, "review queue full; dropped oldest pending fix");
        }

        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        let id = fix.id.clone();
        queue.items.push(ReviewItem::new(fix, sequence));
        Ok(id)
    }

    fn decide(&self, id: &str, decision: Decision, reviewer: &str, comment: Option<&str>) -> bool {
        let mut queue = self.queue();
        let Some(item) = queue.get_mut(id) else {
            return false;
        };
        if item.status != ReviewStatus::Pending {
            return false;
        }
        item.status = decision.status();
        item.reviewer = Some(reviewer.to_string());
        item.reviewed_at = Some(Utc::now());
        item.comment = comment.map(str::to_string);
        debug!(fix = %id, status = item.status.as_str(), reviewer, "review decision");
        true
    }

    pub fn approve(&self, id: &str, reviewer: &str, comment: Option<&str>) -> bool {
        self.decide(id, Decision::Approve, reviewer, comment)
    }

    pub fn reject(&self, id: &str, reviewer: &str, comment: Option<&str>) -> bool {
        self.decide(id, Decision::Reject, reviewer, comment)
    }

    pub fn skip(&self, id: &str, reviewer: &str, comment: Option<&str>) -> bool {
        self.decide(id, Decision::Skip, reviewer, comment)
    }

    fn decide_all(&self, decision: Decision, reviewer: &str, comment: Option<&str>) -> usize {
        let pending: Vec<String> = self.pending().into_iter().map(|item| item.id).collect();
        pending
            .iter()
            .filter(|id| match decision {
                Decision::Approve => self.approve(id, reviewer, comment),
                Decision::Reject => self.reject(id, reviewer, comment),
                Decision::Skip => self.skip(id, reviewer, comment),
            })
            .count()
    }

    pub fn approve_all(&self, reviewer: &str) -> usize {
        self.decide_all(Decision::Approve, reviewer, None)
    }

    pub fn reject_all(&self, reviewer: &str, reason: Option<&str>) -> usize {
        self.decide_all(Decision::Reject, reviewer, reason)
    }

    /// Put a failed or skipped item back to `approved` for the next apply run.
    pub fn requeue(&self, id: &str) -> Result<bool, ReviewError> {
        let mut queue = self.queue();
        let item = queue
            .get_mut(id)
            .ok_or_else(|| ReviewError::NotFound(id.to_string()))?;
        if !matches!(item.status, ReviewStatus::Failed | ReviewStatus::Skipped) {
            return Ok(false);
        }
        item.status = ReviewStatus::Approved;
        item.apply_result = None;
        Ok(true)
    }

    /// Apply every approved item.
    ///
    /// Only one call runs at a time; a concurrent call fails with
    /// [`ReviewError::AlreadyApplying`]. A dry run reports what would happen
    /// and leaves every item's status alone.
    pub async fn apply_approved(&self, options: ApplyApprovedOptions) -> Result<ApplyReport, ReviewError> {
        let _admission = self
            .applying
            .try_lock()
            .map_err(|_| ReviewError::AlreadyApplying)?;

        let approved: Vec<ProposedFix> = self.approved().into_iter().map(|item| item.fix).collect();
        let mut report = ApplyReport {
            dry_run: options.dry_run,
            ..Default::default()
        };
        if approved.is_empty() {
            return Ok(report);
        }

        let width = options
            .max_concurrent
            .unwrap_or(self.settings.max_concurrent)
            .max(1)
            .min(approved.len());
        let policy = RetryPolicy::new(
            options.max_retries.unwrap_or(self.settings.max_retries),
            self.settings.retry_base_delay_ms,
        );
        let apply_options = ApplyOptions {
            dry_run: options.dry_run,
            create_backup: options.create_backup,
        };

        let mut batches = approved.chunks(width);
        for batch in batches.by_ref() {
            report.batches.push(batch.len());
            debug!(size = batch.len(), "applying review batch");

            let outcomes = join_all(batch.iter().map(|fix| async move {
                let retried = with_backoff(
                    policy,
                    &fix.id,
                    |_| self.applier.apply(fix, apply_options),
                    |result: &ApplyResult| result.success,
                )
                .await;
                (fix.id.clone(), retried)
            }))
            .await;

            let mut batch_failed = false;
            for (id, retried) in outcomes {
                let result = match retried.result {
                    Ok(result) => result,
                    Err(err) => ApplyResult::failed(err.to_string()),
                };
                if result.success {
                    report.applied.push(id.clone());
                } else {
                    batch_failed = true;
                    warn!(fix = %id, error = result.error.as_deref().unwrap_or("unknown"), "fix failed to apply");
                    report.failed.push(id.clone());
                }
                if !options.dry_run {
                    self.record_result(&id, result, retried.retries);
                }
            }

            if batch_failed && options.stop_on_first_failure {
                break;
            }
        }

        for fix in batches.flatten() {
            report.skipped.push(fix.id.clone());
            if !options.dry_run {
                if let Some(item) = self.queue().get_mut(&fix.id) {
                    item.status = ReviewStatus::Skipped;
                }
            }
        }

        info!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            batches = report.batches.len(),
            dry_run = report.dry_run,
            "review apply finished"
        );
        Ok(report)
    }

    fn record_result(&self, id: &str, result: ApplyResult, retries: u32) {
        let mut queue = self.queue();
        let Some(item) = queue.get_mut(id) else {
            return;
        };
        item.retry_count = retries;
        if result.success {
            item.status = ReviewStatus::Applied;
            item.applied_at = Some(Utc::now());
        } else {
            item.status = ReviewStatus::Failed;
        }
        item.apply_result = Some(result);
    }

    // ── queries ────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<ReviewItem> {
        self.queue().items.iter().find(|item| item.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.queue().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items in queue order.
    pub fn items(&self) -> Vec<ReviewItem> {
        self.queue().items.clone()
    }

    fn with_status(&self, status: ReviewStatus) -> Vec<ReviewItem> {
        self.filtered(&ReviewFilter {
            status: Some(status),
            ..Default::default()
        })
    }

    pub fn pending(&self) -> Vec<ReviewItem> {
        self.with_status(ReviewStatus::Pending)
    }

    pub fn approved(&self) -> Vec<ReviewItem> {
        self.with_status(ReviewStatus::Approved)
    }

    pub fn rejected(&self) -> Vec<ReviewItem> {
        self.with_status(ReviewStatus::Rejected)
    }

    pub fn applied(&self) -> Vec<ReviewItem> {
        self.with_status(ReviewStatus::Applied)
    }

    pub fn filtered(&self, filter: &ReviewFilter) -> Vec<ReviewItem> {
        self.queue()
            .items
            .iter()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect()
    }

    /// Fixes upstream rejected before they reached the queue.
    pub fn rejections(&self) -> Vec<RejectedFix> {
        self.queue().rejections.clone()
    }

    pub fn summary(&self) -> ReviewSummary {
        let queue = self.queue();
        let mut summary = ReviewSummary {
            total: queue.items.len(),
            ..Default::default()
        };
        for item in &queue.items {
            match item.status {
                ReviewStatus::Pending => summary.pending += 1,
                ReviewStatus::Approved => summary.approved += 1,
                ReviewStatus::Rejected => summary.rejected += 1,
                ReviewStatus::Applied => summary.applied += 1,
                ReviewStatus::Failed => summary.failed += 1,
                ReviewStatus::Skipped => summary.skipped += 1,
            }
        }
        summary.oldest_pending_secs = queue
            .oldest_pending()
            .map(|pos| (Utc::now() - queue.items[pos].queued_at).num_seconds().max(0));
        summary
    }

    /// Drop applied, rejected and skipped items along with the rejection
    /// records from `process`. Returns how many items were removed.
    pub fn clear_decided(&self) -> usize {
        let mut queue = self.queue();
        queue.rejections.clear();
        let before = queue.items.len();
        queue.items.retain(|item| {
            !matches!(
                item.status,
                ReviewStatus::Applied | ReviewStatus::Rejected | ReviewStatus::Skipped
            )
        });
        before - queue.items.len()
    }

    pub fn format(&self, format: ReviewFormat) -> String {
        render(&self.items(), &self.summary(), format)
    }

    pub fn pr_comment(&self) -> String {
        pr_comment(&self.items(), &self.summary())
    }
}
