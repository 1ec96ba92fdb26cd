//! Guard rails: safety policy and loop detection applied before any
//! delegate invocation is issued.

pub mod evaluator;
pub mod history;

pub use evaluator::{GuardConfig, GuardRailEvaluator, GuardVerdict, ProposedInvocation, Violation};
pub use history::{
    fingerprint, ActionHistory, ActionHistoryEntry, ActorId, EntryOutcome,
    DEFAULT_HISTORY_CAPACITY,
};
