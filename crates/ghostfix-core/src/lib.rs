//! Core domain model and contracts for ghostfix.

pub mod finding;
pub mod mission;
pub mod protocol;
pub mod review;
pub mod risk;
pub mod state;

pub use finding::{Finding, Severity};
pub use mission::{Mission, MissionStatus, RiskTier, VerificationPlan};
pub use protocol::*;
pub use review::{ApplyResult, FixResult, ProposedFix, ReviewItem, ReviewStatus};
pub use risk::PatchProposal;
pub use state::{AutoFixState, Node};
