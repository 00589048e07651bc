//! Node transitions. Each takes the run state and returns the next node.

use super::{AutoFixOrchestrator, OrchestratorError};
use crate::retry::with_backoff;
use anyhow::{anyhow, Result};
use ghostfix_adapters::checkpoint::RestoreOptions;
use ghostfix_adapters::util::truncate;
use ghostfix_core::mission::{cluster_findings, MissionStatus, RiskTier};
use ghostfix_core::protocol::{Receipt, Signal, ToolOperation, ToolOutcome};
use ghostfix_core::risk::PatchProposal;
use ghostfix_core::state::{
    AutoFixState, CheckKind, CheckResult, CheckStatus, Node, VerificationResult,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_CHECK_OUTPUT: usize = 2_000;

/// What `patch.propose` is expected to return in `data`
#[derive(Debug, Default, Deserialize)]
struct ProposedPatchData {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    files_modified: Option<Vec<PathBuf>>,
    #[serde(default)]
    lines_changed: usize,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    rollback_plan: Option<String>,
    #[serde(default)]
    diff: Option<String>,
}

pub(super) fn cancel_current_mission(state: &mut AutoFixState) {
    if let Some(mission) = state.current_mission_mut() {
        mission.status = MissionStatus::Cancelled;
        info!(mission = %mission.id, "mission cancelled at approval gate");
    }
    state.current_mission_id = None;
    state.risk_score = None;
}

fn checkpoint_id_from(outcome: &ToolOutcome) -> Option<String> {
    outcome
        .data
        .as_ref()
        .and_then(|data| data.get("checkpoint_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn current_mission_id(state: &AutoFixState) -> Result<String> {
    state
        .current_mission_id
        .clone()
        .ok_or_else(|| OrchestratorError::MissingMission("<none>".to_string()).into())
}

impl AutoFixOrchestrator {
    pub(super) fn ingest_findings(&self, state: &mut AutoFixState) -> Node {
        let mut seen = HashSet::new();
        let before = state.findings.len();
        state.findings.retain(|finding| {
            if finding.id.trim().is_empty() || finding.kind.trim().is_empty() {
                warn!(finding = %finding.id, "dropping finding without id or type");
                return false;
            }
            if !seen.insert(finding.id.clone()) {
                warn!(finding = %finding.id, "dropping duplicate finding");
                return false;
            }
            true
        });
        info!(
            run = %state.run_id,
            kept = state.findings.len(),
            dropped = before - state.findings.len(),
            "findings ingested"
        );
        Node::ClusterToMissions
    }

    pub(super) fn cluster_to_missions(&self, state: &mut AutoFixState) -> Node {
        state.missions = cluster_findings(&state.findings, self.config.max_attempts);
        for mission in &state.missions {
            info!(
                mission = %mission.id,
                kind = %mission.finding_kind,
                tier = mission.risk_tier.label(),
                files = mission.files_in_scope.len(),
                "mission planned"
            );
        }
        Node::SelectMission
    }

    pub(super) fn select_mission(&self, state: &mut AutoFixState) -> Node {
        state.current_mission_id = None;
        state.checkpoint_id = None;
        state.risk_score = None;

        let Some(mission) = state.missions.iter_mut().find(|m| m.can_attempt()) else {
            return Node::Emit;
        };
        mission.attempts += 1;
        mission.status = MissionStatus::InProgress;
        info!(
            mission = %mission.id,
            attempt = mission.attempts,
            max_attempts = mission.max_attempts,
            "mission selected"
        );
        state.current_mission_id = Some(mission.id.clone());
        Node::ProposePatch
    }

    pub(super) async fn propose_patch(&self, state: &mut AutoFixState) -> Result<Node> {
        let mission_id = current_mission_id(state)?;
        let mission = state
            .mission(&mission_id)
            .ok_or_else(|| OrchestratorError::MissingMission(mission_id.clone()))?;
        let payload = json!({
            "run_id": state.run_id,
            "mission": mission,
        });
        let default_files = mission.files_in_scope.clone();

        let proposal = match self.tools.execute(ToolOperation::PatchPropose, payload).await {
            Ok(outcome) if outcome.success => {
                let data = outcome.data.unwrap_or_else(|| json!({}));
                serde_json::from_value::<ProposedPatchData>(data)
                    .map_err(|e| format!("unreadable proposal: {}", e))
            }
            Ok(outcome) => Err(outcome.error_text(ToolOperation::PatchPropose)),
            Err(err) => Err(format!("{:#}", err)),
        };

        let data = match proposal {
            Ok(data) => data,
            Err(reason) => {
                // Fails the mission outright; attempts left are not consulted.
                warn!(mission = %mission_id, reason = %reason, "patch proposal failed");
                if let Some(mission) = state.mission_mut(&mission_id) {
                    mission.status = MissionStatus::Failed;
                }
                state.current_mission_id = None;
                return Ok(Node::SelectMission);
            }
        };

        let patch = PatchProposal {
            id: data
                .id
                .unwrap_or_else(|| format!("patch_{}", &Uuid::new_v4().simple().to_string()[..8])),
            mission_id: mission_id.clone(),
            files_modified: data.files_modified.unwrap_or(default_files),
            lines_changed: data.lines_changed,
            risk_score: 0,
            risk_tier: RiskTier::Low,
            explanation: data.explanation,
            rollback_plan: data
                .rollback_plan
                .unwrap_or_else(|| "Restore the checkpoint taken before apply".to_string()),
            diff: data.diff,
        };
        info!(
            mission = %mission_id,
            patch = %patch.id,
            files = patch.files_modified.len(),
            lines = patch.lines_changed,
            "patch proposed"
        );
        state.patch_candidates.push(patch);
        Ok(Node::RiskScorePatch)
    }

    pub(super) fn risk_score_patch(&self, state: &mut AutoFixState) -> Result<Node> {
        let mission_id = current_mission_id(state)?;
        let tier = state
            .mission(&mission_id)
            .map(|m| m.risk_tier)
            .ok_or_else(|| OrchestratorError::MissingMission(mission_id.clone()))?;
        let patch = state
            .current_patch_mut()
            .ok_or_else(|| OrchestratorError::MissingPatch(mission_id.clone()))?;

        *patch = patch.clone().scored(tier);
        let score = patch.risk_score;
        info!(patch = %patch.id, score, tier = patch.risk_tier.label(), "patch scored");
        state.risk_score = Some(score);
        Ok(Node::ApprovalGate)
    }

    pub(super) async fn approval_gate(&self, state: &mut AutoFixState) -> Result<Node> {
        let mission_id = current_mission_id(state)?;
        let mission = state
            .mission(&mission_id)
            .ok_or_else(|| OrchestratorError::MissingMission(mission_id.clone()))?;
        let patch = state
            .current_patch()
            .ok_or_else(|| OrchestratorError::MissingPatch(mission_id.clone()))?;

        let required = patch.risk_tier == RiskTier::High
            || patch.risk_score > self.config.auto_approve_threshold;
        if !required {
            return Ok(Node::ApplyPatch);
        }

        let Some(handler) = &self.approval else {
            info!(mission = %mission_id, score = patch.risk_score, "waiting for approval");
            state.awaiting_approval = true;
            return Ok(Node::AwaitingApproval);
        };

        if handler.approve(mission, patch).await {
            info!(mission = %mission_id, "patch approved");
            Ok(Node::ApplyPatch)
        } else {
            cancel_current_mission(state);
            Ok(Node::SelectMission)
        }
    }

    pub(super) async fn apply_patch(&self, state: &mut AutoFixState) -> Result<Node> {
        let mission_id = current_mission_id(state)?;
        let patch = state
            .current_patch()
            .ok_or_else(|| OrchestratorError::MissingPatch(mission_id.clone()))?;
        let patch_id = patch.id.clone();
        let payload = json!({
            "run_id": state.run_id,
            "mission_id": mission_id,
            "patch": patch,
        });

        let retried = with_backoff(
            self.config.apply_retry,
            ToolOperation::PatchApply.as_str(),
            |_| self.tools.execute(ToolOperation::PatchApply, payload.clone()),
            |outcome: &ToolOutcome| outcome.success,
        )
        .await;

        let apply_error = match &retried.result {
            Ok(outcome) => {
                state.checkpoint_id = checkpoint_id_from(outcome);
                (!outcome.success).then(|| outcome.error_text(ToolOperation::PatchApply))
            }
            Err(err) => Some(format!("{:#}", err)),
        };

        match apply_error {
            None => {
                info!(
                    patch = %patch_id,
                    checkpoint = state.checkpoint_id.as_deref().unwrap_or("none"),
                    "patch applied"
                );
                Ok(Node::VerifyPatch)
            }
            Some(error) => {
                warn!(patch = %patch_id, retries = retried.retries, error = %error, "patch apply failed");
                state.verification_results.push(VerificationResult {
                    mission_id,
                    patch_id: Some(patch_id),
                    passed: false,
                    checks: Vec::new(),
                    apply_error: Some(error),
                });
                Ok(Node::AcceptOrRollback)
            }
        }
    }

    pub(super) async fn verify_patch(&self, state: &mut AutoFixState) -> Result<Node> {
        let mission_id = current_mission_id(state)?;
        let mission = state
            .mission(&mission_id)
            .ok_or_else(|| OrchestratorError::MissingMission(mission_id.clone()))?;
        let plan = mission.verification;
        let files = mission.files_in_scope.clone();
        let patch_id = state.current_patch().map(|p| p.id.clone());

        let mut checks = Vec::new();
        if plan.typecheck {
            checks.push(self.run_check(state, CheckKind::Typecheck, &files).await);
        }
        if plan.unit_tests {
            let typecheck_failed = checks.iter().any(|c| c.status == CheckStatus::Fail);
            if typecheck_failed {
                checks.push(CheckResult {
                    kind: CheckKind::UnitTests,
                    status: CheckStatus::Skipped,
                    output: "typecheck failed".to_string(),
                });
            } else {
                checks.push(self.run_check(state, CheckKind::UnitTests, &files).await);
            }
        }

        let passed = checks.iter().all(|c| c.status != CheckStatus::Fail);
        info!(mission = %mission_id, passed, checks = checks.len(), "patch verified");
        state.verification_results.push(VerificationResult {
            mission_id,
            patch_id,
            passed,
            checks,
            apply_error: None,
        });
        Ok(Node::AcceptOrRollback)
    }

    /// Run one check and record its receipt. A check whose receipt cannot be
    /// stored counts as failed, so the patch is rolled back.
    async fn run_check(&self, state: &AutoFixState, kind: CheckKind, files: &[PathBuf]) -> CheckResult {
        let payload = json!({
            "run_id": state.run_id,
            "mission_id": state.current_mission_id,
            "kind": kind.as_str(),
            "files": files,
        });
        let (mut status, mut output) = match self.tools.execute(ToolOperation::TestRun, payload).await {
            Ok(outcome) if outcome.success => (
                CheckStatus::Pass,
                outcome.data.map(|d| d.to_string()).unwrap_or_default(),
            ),
            Ok(outcome) => (CheckStatus::Fail, outcome.error_text(ToolOperation::TestRun)),
            Err(err) => (CheckStatus::Fail, format!("{:#}", err)),
        };

        let passed = status == CheckStatus::Pass;
        let title = state
            .current_mission()
            .map(|m| m.title.as_str())
            .unwrap_or("unknown mission");
        let stored = self
            .evidence
            .store_receipt(Receipt {
                run_id: state.run_id.clone(),
                kind: format!("verification.{}", kind.as_str()),
                summary: format!(
                    "{} {} for {}",
                    kind.as_str(),
                    if passed { "passed" } else { "failed" },
                    title
                ),
                signals: vec![Signal {
                    name: format!("{}_passed", kind.as_str()),
                    value: Value::Bool(passed),
                }],
            })
            .await;
        if let Err(err) = stored {
            warn!(check = kind.as_str(), error = %err, "verification receipt not stored");
            status = CheckStatus::Fail;
            output = format!("receipt not stored: {:#}\n{}", err, output);
        }

        CheckResult {
            kind,
            status,
            output: truncate(&output, MAX_CHECK_OUTPUT),
        }
    }

    pub(super) async fn accept_or_rollback(&self, state: &mut AutoFixState) -> Result<Node> {
        let mission_id = current_mission_id(state)?;
        let passed = state.current_verification().is_some_and(|v| v.passed);
        let checkpoint_id = state.checkpoint_id.take();

        if !passed {
            if let Some(checkpoint_id) = &checkpoint_id {
                self.rollback(state, &mission_id, checkpoint_id).await?;
            }
        }

        let mission = state
            .mission_mut(&mission_id)
            .ok_or_else(|| OrchestratorError::MissingMission(mission_id.clone()))?;
        mission.status = if passed {
            MissionStatus::Completed
        } else if mission.has_attempts_left() {
            MissionStatus::Pending
        } else {
            MissionStatus::Failed
        };
        info!(
            mission = %mission.id,
            status = ?mission.status,
            attempts = mission.attempts,
            "mission attempt finished"
        );

        state.current_mission_id = None;
        state.checkpoint_id = None;
        state.risk_score = None;
        Ok(Node::SelectMission)
    }

    async fn rollback(&self, state: &AutoFixState, mission_id: &str, checkpoint_id: &str) -> Result<()> {
        if let Some(store) = &self.checkpoints {
            let report = store.restore(
                checkpoint_id,
                RestoreOptions {
                    backup_first: false,
                    ..Default::default()
                },
            )?;
            info!(
                checkpoint = %checkpoint_id,
                restored = report.restored.len(),
                "rolled back failed patch"
            );
            return Ok(());
        }

        let payload = json!({
            "run_id": state.run_id,
            "mission_id": mission_id,
            "patch_id": state.current_patch().map(|p| p.id.clone()),
            "checkpoint_id": checkpoint_id,
        });
        let outcome = self.tools.execute(ToolOperation::PatchRollback, payload).await?;
        if !outcome.success {
            return Err(anyhow!(
                "rollback to {} failed: {}",
                checkpoint_id,
                outcome.error_text(ToolOperation::PatchRollback)
            ));
        }
        info!(checkpoint = %checkpoint_id, "rolled back failed patch");
        Ok(())
    }

    pub(super) fn emit(&self, state: &mut AutoFixState) -> Node {
        info!(
            run = %state.run_id,
            missions = state.missions.len(),
            completed = state.count_missions(MissionStatus::Completed),
            failed = state.count_missions(MissionStatus::Failed),
            cancelled = state.count_missions(MissionStatus::Cancelled),
            "autofix results"
        );
        Node::Complete
    }
}
