//! Missions: grouped repair work for one finding type
//!
//! Clustering turns a flat list of findings into missions, one per finding
//! type, ordered so the riskiest and then the smallest missions run first.

use crate::finding::{Finding, Severity};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use uuid::Uuid;

/// Maximum files a single mission may touch
pub const MAX_FILES_IN_SCOPE: usize = 10;

/// Default attempts per mission before it is marked failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Risk classification shared by missions and patches
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn label(&self) -> &'static str {
        match self {
            RiskTier::Low => "LOW",
            RiskTier::Medium => "MEDIUM",
            RiskTier::High => "HIGH",
        }
    }

    /// Tier for a group of findings: the worst severity decides.
    pub fn from_severities<I>(severities: I) -> Self
    where
        I: IntoIterator<Item = Severity>,
    {
        let mut tier = RiskTier::Low;
        for severity in severities {
            match severity {
                Severity::Critical => return RiskTier::High,
                Severity::High => tier = RiskTier::Medium,
                Severity::Medium | Severity::Low => {}
            }
        }
        tier
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionStatus::Completed | MissionStatus::Failed | MissionStatus::Cancelled
        )
    }
}

/// Which checks verification runs for a mission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPlan {
    pub typecheck: bool,
    pub unit_tests: bool,
}

impl Default for VerificationPlan {
    fn default() -> Self {
        Self {
            typecheck: true,
            unit_tests: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub title: String,
    pub hypothesis: String,
    pub files_in_scope: Vec<PathBuf>,
    pub acceptance_criteria: Vec<String>,
    pub verification: VerificationPlan,
    pub risk_tier: RiskTier,
    pub status: MissionStatus,
    /// Finding type this mission repairs
    pub finding_kind: String,
    pub source_finding_ids: Vec<String>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Mission {
    pub fn can_attempt(&self) -> bool {
        self.status == MissionStatus::Pending && self.attempts < self.max_attempts
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Per-type repair knowledge used when building missions
#[derive(Debug, Clone)]
pub struct MissionTemplate {
    pub hypothesis: String,
    pub acceptance_criteria: Vec<String>,
    pub verification: VerificationPlan,
}

fn template(
    hypothesis: &str,
    criteria: &[&str],
    typecheck: bool,
    unit_tests: bool,
) -> MissionTemplate {
    MissionTemplate {
        hypothesis: hypothesis.to_string(),
        acceptance_criteria: criteria.iter().map(|c| c.to_string()).collect(),
        verification: VerificationPlan {
            typecheck,
            unit_tests,
        },
    }
}

/// Look up the template for a finding type, falling back to a generic one.
pub fn mission_template(kind: &str) -> MissionTemplate {
    match kind {
        "ghost-route" => template(
            "Client code calls API routes that no server handler defines",
            &[
                "Every referenced route resolves to a registered handler",
                "No placeholder routes are added just to satisfy callers",
                "Typecheck passes",
            ],
            true,
            true,
        ),
        "ghost-env" => template(
            "Code reads environment variables that are never declared",
            &[
                "Every referenced environment variable is declared in the env schema or example file",
                "Reads of undeclared variables are removed or guarded with a default",
                "Typecheck passes",
            ],
            true,
            false,
        ),
        "ghost-type" => template(
            "Code references types that do not exist in the codebase or its dependencies",
            &[
                "All referenced types resolve to real declarations",
                "No casts to `any` are introduced to silence errors",
                "Typecheck passes",
            ],
            true,
            false,
        ),
        "ghost-import" => template(
            "Imports point at modules or packages that are not present",
            &[
                "All imports resolve to existing modules or installed packages",
                "No unused imports remain",
                "Typecheck passes",
            ],
            true,
            true,
        ),
        "auth-gap" => template(
            "Protected handlers are reachable without an authentication check",
            &[
                "Every protected handler enforces authentication",
                "Existing auth tests pass",
            ],
            true,
            true,
        ),
        "contract-drift" => template(
            "Callers and providers disagree on a request or response shape",
            &[
                "Request and response shapes match on both sides",
                "Typecheck passes",
            ],
            true,
            true,
        ),
        other => template(
            &format!(
                "Findings of type `{}` reference things the codebase cannot satisfy",
                other
            ),
            &["All findings of this type are resolved", "Typecheck passes"],
            true,
            true,
        ),
    }
}

/// Mission id: `mission_<epoch-ms>_<8 hex>`
pub fn new_mission_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("mission_{}_{}", Utc::now().timestamp_millis(), &random[..8])
}

/// Group findings by type into missions and order them for execution.
pub fn cluster_findings(findings: &[Finding], max_attempts: u32) -> Vec<Mission> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&Finding>> = HashMap::new();
    for finding in findings {
        let kind = finding.kind.as_str();
        groups
            .entry(kind)
            .or_insert_with(|| {
                order.push(kind);
                Vec::new()
            })
            .push(finding);
    }

    let mut missions: Vec<Mission> = order
        .into_iter()
        .filter_map(|kind| groups.get(kind).map(|group| build_mission(kind, group, max_attempts)))
        .collect();
    sort_missions(&mut missions);
    missions
}

fn build_mission(kind: &str, group: &[&Finding], max_attempts: u32) -> Mission {
    let template = mission_template(kind);

    let mut seen = HashSet::new();
    let mut files_in_scope = Vec::new();
    for file in group.iter().filter_map(|f| f.file.as_ref()) {
        if files_in_scope.len() >= MAX_FILES_IN_SCOPE {
            break;
        }
        if seen.insert(file.clone()) {
            files_in_scope.push(file.clone());
        }
    }

    let count = group.len();
    Mission {
        id: new_mission_id(),
        title: format!(
            "Fix {} {} finding{}",
            count,
            kind,
            if count == 1 { "" } else { "s" }
        ),
        hypothesis: template.hypothesis,
        files_in_scope,
        acceptance_criteria: template.acceptance_criteria,
        verification: template.verification,
        risk_tier: RiskTier::from_severities(group.iter().map(|f| f.severity)),
        status: MissionStatus::Pending,
        finding_kind: kind.to_string(),
        source_finding_ids: group.iter().map(|f| f.id.clone()).collect(),
        attempts: 0,
        max_attempts: max_attempts.max(1),
    }
}

/// HIGH before MEDIUM before LOW; ties go to the mission touching fewer files.
pub fn sort_missions(missions: &mut [Mission]) {
    missions.sort_by(|a, b| {
        b.risk_tier
            .cmp(&a.risk_tier)
            .then_with(|| a.files_in_scope.len().cmp(&b.files_in_scope.len()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn finding(id: &str, kind: &str, severity: Severity, file: &str) -> Finding {
        Finding::new(id, kind, severity).with_file(file)
    }

    #[test]
    fn ghost_env_findings_form_one_medium_mission() {
        let findings = vec![
            finding("f1", "ghost-env", Severity::Low, "src/a.ts"),
            finding("f2", "ghost-env", Severity::Low, "src/b.ts"),
            finding("f3", "ghost-env", Severity::High, "src/a.ts"),
        ];
        let missions = cluster_findings(&findings, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(missions.len(), 1);
        let mission = &missions[0];
        assert_eq!(mission.risk_tier, RiskTier::Medium);
        assert_eq!(
            mission.acceptance_criteria,
            mission_template("ghost-env").acceptance_criteria
        );
        assert_eq!(
            mission.files_in_scope,
            vec![PathBuf::from("src/a.ts"), PathBuf::from("src/b.ts")]
        );
        assert_eq!(mission.title, "Fix 3 ghost-env findings");
    }

    #[test]
    fn critical_finding_makes_mission_high() {
        let findings = vec![
            finding("f1", "auth-gap", Severity::Low, "src/a.ts"),
            finding("f2", "auth-gap", Severity::Critical, "src/b.ts"),
            finding("f3", "auth-gap", Severity::High, "src/c.ts"),
        ];
        let missions = cluster_findings(&findings, 3);
        assert_eq!(missions[0].risk_tier, RiskTier::High);
    }

    #[test]
    fn files_in_scope_are_capped() {
        let findings: Vec<Finding> = (0..25)
            .map(|i| finding(&format!("f{}", i), "ghost-type", Severity::Low, &format!("src/{}.ts", i)))
            .collect();
        let missions = cluster_findings(&findings, 3);
        assert_eq!(missions[0].files_in_scope.len(), MAX_FILES_IN_SCOPE);
        assert_eq!(missions[0].source_finding_ids.len(), 25);
    }

    #[test]
    fn unknown_type_uses_generic_template() {
        let template = mission_template("phantom-widget");
        assert!(template.hypothesis.contains("phantom-widget"));
        assert_eq!(template.acceptance_criteria.len(), 2);
    }

    #[test]
    fn ties_prefer_smaller_missions() {
        let findings = vec![
            finding("a1", "ghost-route", Severity::High, "src/r1.ts"),
            finding("a2", "ghost-route", Severity::High, "src/r2.ts"),
            finding("b1", "ghost-import", Severity::High, "src/i1.ts"),
            finding("c1", "ghost-type", Severity::Low, "src/t1.ts"),
            finding("d1", "auth-gap", Severity::Critical, "src/auth.ts"),
        ];
        let missions = cluster_findings(&findings, 3);
        let kinds: Vec<&str> = missions.iter().map(|m| m.finding_kind.as_str()).collect();
        assert_eq!(kinds, vec!["auth-gap", "ghost-import", "ghost-route", "ghost-type"]);
    }

    #[test]
    fn mission_id_has_expected_shape() {
        let id = new_mission_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "mission");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    fn arb_severity() -> impl Strategy<Value = Severity> {
        prop_oneof![
            Just(Severity::Low),
            Just(Severity::Medium),
            Just(Severity::High),
            Just(Severity::Critical),
        ]
    }

    fn arb_findings() -> impl Strategy<Value = Vec<Finding>> {
        prop::collection::vec(
            (
                prop_oneof![
                    Just("ghost-env"),
                    Just("ghost-route"),
                    Just("ghost-type"),
                    Just("ghost-import"),
                    Just("custom"),
                ],
                arb_severity(),
                0usize..15,
            ),
            0..40,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(i, (kind, severity, file))| {
                    finding(&format!("f{}", i), kind, severity, &format!("src/{}.ts", file))
                })
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_missions_partition_findings(findings in arb_findings()) {
            let missions = cluster_findings(&findings, 3);
            let mut ids: Vec<String> = missions
                .iter()
                .flat_map(|m| m.source_finding_ids.iter().cloned())
                .collect();
            prop_assert_eq!(ids.len(), findings.len());
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), findings.len());
            for mission in &missions {
                prop_assert!(mission.files_in_scope.len() <= MAX_FILES_IN_SCOPE);
            }
        }

        #[test]
        fn prop_missions_are_ordered(findings in arb_findings()) {
            let missions = cluster_findings(&findings, 3);
            for pair in missions.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.risk_tier >= b.risk_tier);
                if a.risk_tier == b.risk_tier {
                    prop_assert!(a.files_in_scope.len() <= b.files_in_scope.len());
                }
            }
        }
    }
}
