//! Read-only renderings of the review queue

use super::ReviewSummary;
use ghostfix_core::review::{FixPatch, ReviewItem, ReviewStatus};
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewFormat {
    Markdown,
    Json,
    /// One combined unified diff of the pending and approved fixes
    Patch,
    /// Every item's diff under a short header
    Diff,
}

impl FromStr for ReviewFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ReviewFormat::Markdown),
            "json" => Ok(ReviewFormat::Json),
            "patch" => Ok(ReviewFormat::Patch),
            "diff" => Ok(ReviewFormat::Diff),
            other => Err(format!("Unknown review format: {}", other)),
        }
    }
}

pub fn render(items: &[ReviewItem], summary: &ReviewSummary, format: ReviewFormat) -> String {
    match format {
        ReviewFormat::Markdown => markdown(items, summary),
        ReviewFormat::Json => serde_json::to_string_pretty(items).unwrap_or_else(|_| "[]".into()),
        ReviewFormat::Patch => combined_patch(items),
        ReviewFormat::Diff => item_diffs(items),
    }
}

fn status_marker(status: ReviewStatus) -> &'static str {
    match status {
        ReviewStatus::Pending => "[ ]",
        ReviewStatus::Approved => "[+]",
        ReviewStatus::Rejected => "[-]",
        ReviewStatus::Applied => "[x]",
        ReviewStatus::Failed => "[!]",
        ReviewStatus::Skipped => "[~]",
    }
}

fn location(item: &ReviewItem) -> String {
    let path = item.fix.patch.file_path.display();
    match item.fix.issue.line {
        Some(line) => format!("{}:{}", path, line),
        None => path.to_string(),
    }
}

fn confidence_pct(item: &ReviewItem) -> u32 {
    (item.fix.confidence.clamp(0.0, 1.0) * 100.0).round() as u32
}

fn markdown(items: &[ReviewItem], summary: &ReviewSummary) -> String {
    let mut out = String::from("# Fix Review Queue\n\n");
    let _ = writeln!(
        out,
        "{} total: {} pending, {} approved, {} rejected, {} applied, {} failed, {} skipped\n",
        summary.total,
        summary.pending,
        summary.approved,
        summary.rejected,
        summary.applied,
        summary.failed,
        summary.skipped
    );

    if items.is_empty() {
        out.push_str("No fixes in the queue.\n");
        return out;
    }

    for item in items {
        let _ = writeln!(
            out,
            "## {} `{}` {}\n",
            status_marker(item.status),
            item.id,
            item.fix.issue.kind
        );
        let _ = writeln!(out, "- **File:** `{}`", location(item));
        let _ = writeln!(out, "- **Issue:** {}", item.fix.issue.message);
        let _ = writeln!(out, "- **Confidence:** {}%", confidence_pct(item));
        let _ = writeln!(out, "- **Status:** {}", item.status.as_str());
        if let Some(reviewer) = &item.reviewer {
            let _ = writeln!(out, "- **Reviewer:** {}", reviewer);
        }
        if let Some(comment) = &item.comment {
            let _ = writeln!(out, "- **Comment:** {}", comment);
        }
        if let Some(error) = item.apply_result.as_ref().and_then(|r| r.error.as_deref()) {
            let _ = writeln!(out, "- **Error:** {}", error);
        }
        if !item.fix.explanation.is_empty() {
            let _ = writeln!(out, "\n{}", item.fix.explanation);
        }
        let diff = diff_for(&item.fix.patch);
        if !diff.is_empty() {
            let _ = writeln!(out, "\n```diff\n{}```", diff);
        }
        out.push('\n');
    }
    out
}

fn combined_patch(items: &[ReviewItem]) -> String {
    items
        .iter()
        .filter(|item| matches!(item.status, ReviewStatus::Pending | ReviewStatus::Approved))
        .map(|item| diff_for(&item.fix.patch))
        .collect()
}

fn item_diffs(items: &[ReviewItem]) -> String {
    let mut out = String::new();
    for item in items {
        let _ = writeln!(
            out,
            "=== {} ({}) {} ===",
            item.id,
            item.status.as_str(),
            item.fix.patch.file_path.display()
        );
        out.push_str(&diff_for(&item.fix.patch));
        out.push('\n');
    }
    out
}

/// The fix's own diff, or a whole-file diff built from its contents.
fn diff_for(patch: &FixPatch) -> String {
    if let Some(diff) = patch.diff.as_deref().filter(|d| !d.trim().is_empty()) {
        let mut diff = diff.to_string();
        if !diff.ends_with('\n') {
            diff.push('\n');
        }
        return diff;
    }
    whole_file_diff(patch)
}

fn whole_file_diff(patch: &FixPatch) -> String {
    let path = patch.file_path.display();
    let old = patch.original_content.as_deref().unwrap_or_default();
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = patch.new_content.lines().collect();

    let mut out = String::new();
    if patch.original_content.is_some() {
        let _ = writeln!(out, "--- a/{}", path);
    } else {
        out.push_str("--- /dev/null\n");
    }
    let _ = writeln!(out, "+++ b/{}", path);
    let _ = writeln!(
        out,
        "@@ -{},{} +{},{} @@",
        usize::from(!old_lines.is_empty()),
        old_lines.len(),
        usize::from(!new_lines.is_empty()),
        new_lines.len()
    );
    for line in old_lines {
        let _ = writeln!(out, "-{}", line);
    }
    for line in new_lines {
        let _ = writeln!(out, "+{}", line);
    }
    out
}

/// Pull request comment summarizing applied fixes and what still needs review.
pub fn pr_comment(items: &[ReviewItem], summary: &ReviewSummary) -> String {
    let mut body = String::from("## Ghostfix Review\n\n");

    if items.is_empty() {
        body.push_str("No fixes were proposed.\n\n---\n*Reviewed with ghostfix*");
        return body;
    }

    let _ = writeln!(body, "| Status | Count |\n|---|---|");
    for (label, count) in [
        ("Applied", summary.applied),
        ("Approved", summary.approved),
        ("Pending", summary.pending),
        ("Rejected", summary.rejected),
        ("Failed", summary.failed),
        ("Skipped", summary.skipped),
    ] {
        if count > 0 {
            let _ = writeln!(body, "| {} | {} |", label, count);
        }
    }
    body.push('\n');

    let applied: Vec<&ReviewItem> = items
        .iter()
        .filter(|item| item.status == ReviewStatus::Applied)
        .collect();
    if !applied.is_empty() {
        body.push_str("### Applied\n\n");
        for item in applied {
            let _ = writeln!(
                body,
                "- **{}** in `{}`: {}",
                item.fix.issue.kind,
                location(item),
                item.fix.issue.message
            );
        }
        body.push('\n');
    }

    let waiting: Vec<&ReviewItem> = items
        .iter()
        .filter(|item| item.status == ReviewStatus::Pending)
        .collect();
    if !waiting.is_empty() {
        body.push_str("### Needs review\n\n");
        for item in waiting {
            let _ = writeln!(
                body,
                "- **{}** in `{}` ({}% confidence)",
                item.fix.issue.kind,
                location(item),
                confidence_pct(item)
            );
            let _ = writeln!(
                body,
                "  <details><summary>Diff</summary>\n\n```diff\n{}```\n  </details>",
                diff_for(&item.fix.patch)
            );
        }
        body.push('\n');
    }

    let failed: Vec<&ReviewItem> = items
        .iter()
        .filter(|item| item.status == ReviewStatus::Failed)
        .collect();
    if !failed.is_empty() {
        body.push_str("### Failed to apply\n\n");
        for item in failed {
            let error = item
                .apply_result
                .as_ref()
                .and_then(|r| r.error.as_deref())
                .unwrap_or("unknown error");
            let _ = writeln!(body, "- `{}`: {}", location(item), error);
        }
        body.push('\n');
    }

    body.push_str("---\n*Reviewed with ghostfix*");
    body
}
