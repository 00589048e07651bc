//! Fix orchestration for ghostfix.
//!
//! [`review`] queues proposed fixes for human review and applies the
//! approved ones in bounded batches. [`autofix`] drives findings through the
//! mission state machine, from proposal to verified patch or rollback.

pub mod apply;
pub mod autofix;
pub mod retry;
pub mod review;

pub use apply::CheckpointedApplier;
pub use autofix::{
    ApprovalDecision, ApprovalHandler, AutoFixConfig, AutoFixObserver, AutoFixOrchestrator,
    OrchestratorError, RunOutcome,
};
pub use retry::RetryPolicy;
pub use review::{ApplyApprovedOptions, ApplyReport, ReviewError, ReviewPipeline, ReviewSummary};
