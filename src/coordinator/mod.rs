//! Task coordination: the status machine, the per-task driver, and the
//! engine API that submits, reviews, cancels and resumes tasks.

pub mod driver;
pub mod engine;
pub mod events;
pub mod retry;
pub mod review;
pub mod state;
pub mod synthesis;

pub use driver::{build_payload, next_action, NextAction};
pub use engine::{Engine, EngineBuilder, StatusReport, TaskRequest};
pub use events::{Event, EventBus, EventKind};
pub use retry::RetryConfig;
pub use review::{ReviewAction, ReviewDecision, ReviewPackage};
pub use state::{can_transition, Blocker, CoordinationState};
pub use synthesis::{ReportSynthesizer, Synthesizer};
