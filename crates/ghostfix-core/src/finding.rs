//! Scanner findings consumed by the autofix engine
//!
//! Findings are produced elsewhere (route, env, auth and contract scanners) and
//! arrive here as plain JSON records. The engine only reads them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Severity reported by a scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A single defect reported by a scanner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    /// Finding type, e.g. `ghost-env` or `ghost-route`
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub message: String,
    /// Scanner confidence in `[0, 1]`, when the scanner reports one
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl Finding {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            severity,
            file: None,
            line: None,
            message: String::new(),
            confidence: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_deserializes_type_key() {
        let raw = r#"{"id":"f1","type":"ghost-env","severity":"high","file":"src/env.ts"}"#;
        let finding: Finding = serde_json::from_str(raw).unwrap();
        assert_eq!(finding.kind, "ghost-env");
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.file, Some(PathBuf::from("src/env.ts")));
        assert!(finding.message.is_empty());
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
