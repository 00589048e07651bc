//! The state record threaded through the autofix state machine
//!
//! The driver owns one `AutoFixState` per run and lends it to each node in
//! turn; a node updates it and names the next node. The record is
//! serializable so a run suspended at the approval gate can be
//! persisted and resumed later.

use crate::finding::Finding;
use crate::mission::{Mission, MissionStatus};
use crate::risk::PatchProposal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Node {
    IngestFindings,
    ClusterToMissions,
    SelectMission,
    ProposePatch,
    RiskScorePatch,
    ApprovalGate,
    AwaitingApproval,
    ApplyPatch,
    VerifyPatch,
    AcceptOrRollback,
    Emit,
    Complete,
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::IngestFindings => "IngestFindings",
            Node::ClusterToMissions => "ClusterToMissions",
            Node::SelectMission => "SelectMission",
            Node::ProposePatch => "ProposePatch",
            Node::RiskScorePatch => "RiskScorePatch",
            Node::ApprovalGate => "ApprovalGate",
            Node::AwaitingApproval => "AwaitingApproval",
            Node::ApplyPatch => "ApplyPatch",
            Node::VerifyPatch => "VerifyPatch",
            Node::AcceptOrRollback => "AcceptOrRollback",
            Node::Emit => "Emit",
            Node::Complete => "Complete",
        }
    }

    /// The driver loop stops when it reaches one of these.
    pub fn halts(&self) -> bool {
        matches!(self, Node::Complete | Node::AwaitingApproval)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Typecheck,
    UnitTests,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Typecheck => "typecheck",
            CheckKind::UnitTests => "unit_tests",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: CheckStatus,
    /// Error text or tool output, truncated
    #[serde(default)]
    pub output: String,
}

/// Outcome of verifying one applied patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub mission_id: String,
    #[serde(default)]
    pub patch_id: Option<String>,
    pub passed: bool,
    #[serde(default)]
    pub checks: Vec<CheckResult>,
    /// Set when the patch never reached verification
    #[serde(default)]
    pub apply_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoFixState {
    pub run_id: String,
    pub findings: Vec<Finding>,
    pub missions: Vec<Mission>,
    pub current_mission_id: Option<String>,
    pub patch_candidates: Vec<PatchProposal>,
    pub verification_results: Vec<VerificationResult>,
    pub risk_score: Option<u8>,
    pub checkpoint_id: Option<String>,
    pub node: Node,
    pub error: Option<String>,
    pub awaiting_approval: bool,
    pub iterations: u32,
}

impl AutoFixState {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self {
            run_id: format!("run_{}", Uuid::new_v4().simple()),
            findings,
            missions: Vec::new(),
            current_mission_id: None,
            patch_candidates: Vec::new(),
            verification_results: Vec::new(),
            risk_score: None,
            checkpoint_id: None,
            node: Node::IngestFindings,
            error: None,
            awaiting_approval: false,
            iterations: 0,
        }
    }

    pub fn mission(&self, id: &str) -> Option<&Mission> {
        self.missions.iter().find(|m| m.id == id)
    }

    pub fn mission_mut(&mut self, id: &str) -> Option<&mut Mission> {
        self.missions.iter_mut().find(|m| m.id == id)
    }

    pub fn current_mission(&self) -> Option<&Mission> {
        self.current_mission_id
            .as_deref()
            .and_then(|id| self.mission(id))
    }

    pub fn current_mission_mut(&mut self) -> Option<&mut Mission> {
        let id = self.current_mission_id.clone()?;
        self.mission_mut(&id)
    }

    /// Latest patch proposed for the current mission.
    pub fn current_patch(&self) -> Option<&PatchProposal> {
        let mission_id = self.current_mission_id.as_deref()?;
        self.patch_candidates
            .iter()
            .rev()
            .find(|p| p.mission_id == mission_id)
    }

    pub fn current_patch_mut(&mut self) -> Option<&mut PatchProposal> {
        let mission_id = self.current_mission_id.clone()?;
        self.patch_candidates
            .iter_mut()
            .rev()
            .find(|p| p.mission_id == mission_id)
    }

    /// Latest verification result for the current mission.
    pub fn current_verification(&self) -> Option<&VerificationResult> {
        let mission_id = self.current_mission_id.as_deref()?;
        self.verification_results
            .iter()
            .rev()
            .find(|v| v.mission_id == mission_id)
    }

    pub fn count_missions(&self, status: MissionStatus) -> usize {
        self.missions.iter().filter(|m| m.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::{RiskTier, VerificationPlan};

    fn mission(id: &str) -> Mission {
        Mission {
            id: id.to_string(),
            title: "t".into(),
            hypothesis: "h".into(),
            files_in_scope: Vec::new(),
            acceptance_criteria: Vec::new(),
            verification: VerificationPlan::default(),
            risk_tier: RiskTier::Low,
            status: MissionStatus::Pending,
            finding_kind: "ghost-env".into(),
            source_finding_ids: Vec::new(),
            attempts: 0,
            max_attempts: 3,
        }
    }

    fn patch(id: &str, mission_id: &str) -> PatchProposal {
        PatchProposal {
            id: id.into(),
            mission_id: mission_id.into(),
            files_modified: Vec::new(),
            lines_changed: 0,
            risk_score: 0,
            risk_tier: RiskTier::Low,
            explanation: String::new(),
            rollback_plan: String::new(),
            diff: None,
        }
    }

    #[test]
    fn current_patch_is_latest_for_current_mission() {
        let mut state = AutoFixState::new(Vec::new());
        state.missions = vec![mission("m1"), mission("m2")];
        state.patch_candidates = vec![patch("p1", "m1"), patch("p2", "m2"), patch("p3", "m1")];
        state.current_mission_id = Some("m1".into());
        assert_eq!(state.current_patch().map(|p| p.id.as_str()), Some("p3"));
        state.current_mission_id = None;
        assert!(state.current_patch().is_none());
    }

    #[test]
    fn state_survives_json_round_trip() {
        let mut state = AutoFixState::new(Vec::new());
        state.node = Node::AwaitingApproval;
        state.awaiting_approval = true;
        let json = serde_json::to_string(&state).unwrap();
        let back: AutoFixState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
