//! Mission-driven autofix state machine
//!
//! Findings are clustered into missions. Each mission runs propose → score →
//! approve → apply → verify → accept-or-rollback until it completes or runs
//! out of attempts. One node runs at a time against the run's single
//! [`AutoFixState`].
//!
//! The approval gate is the only suspension point. Without an
//! [`ApprovalHandler`] a run that needs approval stops at
//! [`Node::AwaitingApproval`]; the caller persists the state and later calls
//! [`AutoFixOrchestrator::resume`] with the decision.

mod nodes;

use crate::retry::RetryPolicy;
use ghostfix_adapters::checkpoint::CheckpointStore;
use ghostfix_adapters::config::AutofixSettings;
use ghostfix_core::finding::Finding;
use ghostfix_core::mission::{Mission, MissionStatus, DEFAULT_MAX_ATTEMPTS};
use ghostfix_core::protocol::{BoxFuture, EvidenceSink, ToolExecutor};
use ghostfix_core::risk::PatchProposal;
use ghostfix_core::state::{AutoFixState, Node};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

/// Decides whether a risky patch may be applied.
pub trait ApprovalHandler: Send + Sync {
    fn approve<'a>(&'a self, mission: &'a Mission, patch: &'a PatchProposal) -> BoxFuture<'a, bool>;
}

/// Notified after every node and on node errors.
pub trait AutoFixObserver: Send + Sync {
    fn on_state_change(&self, _state: &AutoFixState) {}

    fn on_error(&self, _error: &str, _node: Node) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Run is not waiting for approval (current node: {0})")]
    NotSuspended(Node),

    #[error("Mission not found: {0}")]
    MissingMission(String),

    #[error("No patch proposed for mission {0}")]
    MissingPatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoFixConfig {
    /// Patches scoring above this need approval
    pub auto_approve_threshold: u8,
    pub max_attempts: u32,
    /// Node executions per `run`/`resume` call
    pub max_iterations: u32,
    /// Retries for `patch.apply`
    pub apply_retry: RetryPolicy,
}

impl Default for AutoFixConfig {
    fn default() -> Self {
        Self {
            auto_approve_threshold: 40,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_iterations: 100,
            apply_retry: RetryPolicy::default(),
        }
    }
}

impl From<&AutofixSettings> for AutoFixConfig {
    fn from(settings: &AutofixSettings) -> Self {
        Self {
            auto_approve_threshold: settings.auto_approve_threshold,
            max_attempts: settings.max_attempts,
            max_iterations: settings.max_iterations,
            apply_retry: RetryPolicy::new(settings.max_retries, settings.retry_base_delay_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// No error and the run reached `Complete`
    pub success: bool,
    pub state: AutoFixState,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub duration: Duration,
}

impl RunOutcome {
    fn new(state: AutoFixState, started: Instant) -> Self {
        Self {
            success: state.error.is_none() && state.node == Node::Complete,
            completed: state.count_missions(MissionStatus::Completed),
            failed: state.count_missions(MissionStatus::Failed),
            cancelled: state.count_missions(MissionStatus::Cancelled),
            duration: started.elapsed(),
            state,
        }
    }

    /// The run stopped at the approval gate and can be resumed.
    pub fn is_suspended(&self) -> bool {
        self.state.node == Node::AwaitingApproval
    }
}

pub struct AutoFixOrchestrator {
    tools: Arc<dyn ToolExecutor>,
    evidence: Arc<dyn EvidenceSink>,
    checkpoints: Option<Arc<CheckpointStore>>,
    approval: Option<Arc<dyn ApprovalHandler>>,
    observer: Option<Arc<dyn AutoFixObserver>>,
    config: AutoFixConfig,
}

impl AutoFixOrchestrator {
    pub fn new(tools: Arc<dyn ToolExecutor>, evidence: Arc<dyn EvidenceSink>) -> Self {
        Self {
            tools,
            evidence,
            checkpoints: None,
            approval: None,
            observer: None,
            config: AutoFixConfig::default(),
        }
    }

    /// Roll failed patches back through this store instead of `patch.rollback`.
    pub fn with_checkpoints(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = Some(handler);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn AutoFixObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_config(mut self, config: AutoFixConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &AutoFixConfig {
        &self.config
    }

    pub async fn run(&self, findings: Vec<Finding>) -> RunOutcome {
        let started = Instant::now();
        let state = AutoFixState::new(findings);
        info!(run = %state.run_id, findings = state.findings.len(), "autofix run started");
        self.drive(state, started).await
    }

    /// Continue a run suspended at the approval gate.
    pub async fn resume(
        &self,
        mut state: AutoFixState,
        decision: ApprovalDecision,
    ) -> Result<RunOutcome, OrchestratorError> {
        let started = Instant::now();
        if state.node != Node::AwaitingApproval {
            return Err(OrchestratorError::NotSuspended(state.node));
        }
        let mission_id = state
            .current_mission_id
            .clone()
            .ok_or_else(|| OrchestratorError::MissingMission("<none>".to_string()))?;
        if state.mission(&mission_id).is_none() {
            return Err(OrchestratorError::MissingMission(mission_id));
        }
        if state.current_patch().is_none() {
            return Err(OrchestratorError::MissingPatch(mission_id));
        }

        info!(run = %state.run_id, mission = %mission_id, ?decision, "resuming autofix run");
        state.awaiting_approval = false;
        state.node = match decision {
            ApprovalDecision::Approve => Node::ApplyPatch,
            ApprovalDecision::Deny => {
                nodes::cancel_current_mission(&mut state);
                Node::SelectMission
            }
        };
        self.notify(&state);
        Ok(self.drive(state, started).await)
    }

    async fn drive(&self, mut state: AutoFixState, started: Instant) -> RunOutcome {
        let mut steps = 0u32;
        while !state.node.halts() {
            if steps >= self.config.max_iterations {
                let message = format!(
                    "Iteration limit ({}) reached at {}",
                    self.config.max_iterations, state.node
                );
                self.fail(&mut state, message);
                break;
            }
            steps += 1;
            state.iterations += 1;

            let node = state.node;
            debug!(run = %state.run_id, node = %node, "entering node");
            match self.step(node, &mut state).await {
                Ok(next) => {
                    state.node = next;
                    self.notify(&state);
                }
                Err(err) => {
                    self.fail(&mut state, format!("{}: {:#}", node, err));
                    break;
                }
            }
        }

        let outcome = RunOutcome::new(state, started);
        info!(
            run = %outcome.state.run_id,
            node = %outcome.state.node,
            success = outcome.success,
            completed = outcome.completed,
            failed = outcome.failed,
            cancelled = outcome.cancelled,
            "autofix run stopped"
        );
        outcome
    }

    async fn step(&self, node: Node, state: &mut AutoFixState) -> anyhow::Result<Node> {
        match node {
            Node::IngestFindings => Ok(self.ingest_findings(state)),
            Node::ClusterToMissions => Ok(self.cluster_to_missions(state)),
            Node::SelectMission => Ok(self.select_mission(state)),
            Node::ProposePatch => self.propose_patch(state).await,
            Node::RiskScorePatch => self.risk_score_patch(state),
            Node::ApprovalGate => self.approval_gate(state).await,
            Node::ApplyPatch => self.apply_patch(state).await,
            Node::VerifyPatch => self.verify_patch(state).await,
            Node::AcceptOrRollback => self.accept_or_rollback(state).await,
            Node::Emit => Ok(self.emit(state)),
            Node::AwaitingApproval | Node::Complete => Ok(node),
        }
    }

    fn notify(&self, state: &AutoFixState) {
        if let Some(observer) = &self.observer {
            observer.on_state_change(state);
        }
    }

    fn fail(&self, state: &mut AutoFixState, message: String) {
        error!(run = %state.run_id, node = %state.node, error = %message, "autofix run failed");
        if let Some(observer) = &self.observer {
            observer.on_error(&message, state.node);
        }
        state.error = Some(message);
    }
}
