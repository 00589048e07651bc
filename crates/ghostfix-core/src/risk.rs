//! Patch proposals and additive risk scoring

use crate::mission::RiskTier;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const SENSITIVE_FILE_POINTS: u32 = 20;
const LARGE_CHANGE_LINES: usize = 100;
const LARGE_CHANGE_POINTS: u32 = 15;
const MEDIUM_CHANGE_LINES: usize = 50;
const MEDIUM_CHANGE_POINTS: u32 = 10;
const WIDE_CHANGE_FILES: usize = 5;
const WIDE_CHANGE_POINTS: u32 = 15;
const MAX_RISK_SCORE: u32 = 100;

pub const HIGH_RISK_THRESHOLD: u8 = 60;
pub const MEDIUM_RISK_THRESHOLD: u8 = 30;

static SENSITIVE_PATH: OnceLock<Option<Regex>> = OnceLock::new();

fn sensitive_path_regex() -> Option<&'static Regex> {
    SENSITIVE_PATH
        .get_or_init(|| Regex::new(r"(?i)auth|security|payment|billing|config|env|secret").ok())
        .as_ref()
}

/// Whether a path names something security- or money-sensitive.
pub fn is_sensitive_path(path: &Path) -> bool {
    let text = path.to_string_lossy();
    sensitive_path_regex()
        .map(|re| re.is_match(&text))
        .unwrap_or(false)
}

/// A candidate change for a mission, not yet applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchProposal {
    pub id: String,
    pub mission_id: String,
    pub files_modified: Vec<PathBuf>,
    pub lines_changed: usize,
    #[serde(default)]
    pub risk_score: u8,
    #[serde(default)]
    pub risk_tier: RiskTier,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub rollback_plan: String,
    /// Unified diff for display, when the proposer provides one
    #[serde(default)]
    pub diff: Option<String>,
}

impl PatchProposal {
    /// Return a copy carrying its risk score and derived tier.
    pub fn scored(mut self, mission_tier: RiskTier) -> Self {
        let score = score_patch(&self.files_modified, self.lines_changed, mission_tier);
        self.risk_score = score;
        self.risk_tier = tier_for_score(score);
        self
    }
}

fn tier_bonus(tier: RiskTier) -> u32 {
    match tier {
        RiskTier::High => 30,
        RiskTier::Medium => 15,
        RiskTier::Low => 0,
    }
}

/// Additive risk score clamped to `[0, 100]`.
pub fn score_patch(files: &[PathBuf], lines_changed: usize, mission_tier: RiskTier) -> u8 {
    let sensitive = files.iter().filter(|f| is_sensitive_path(f)).count() as u32;
    let mut score = sensitive.saturating_mul(SENSITIVE_FILE_POINTS);

    if lines_changed > LARGE_CHANGE_LINES {
        score += LARGE_CHANGE_POINTS;
    } else if lines_changed > MEDIUM_CHANGE_LINES {
        score += MEDIUM_CHANGE_POINTS;
    }

    if files.len() > WIDE_CHANGE_FILES {
        score += WIDE_CHANGE_POINTS;
    }

    score = score.saturating_add(tier_bonus(mission_tier));
    score.min(MAX_RISK_SCORE) as u8
}

pub fn tier_for_score(score: u8) -> RiskTier {
    if score >= HIGH_RISK_THRESHOLD {
        RiskTier::High
    } else if score >= MEDIUM_RISK_THRESHOLD {
        RiskTier::Medium
    } else {
        RiskTier::Low
    }
}
