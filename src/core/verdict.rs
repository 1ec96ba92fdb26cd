//! Quality verdicts rendered after each completed stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the coordinator should do with a completed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Revise,
    EscalateHuman,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Accept => write!(f, "accept"),
            Decision::Revise => write!(f, "revise"),
            Decision::EscalateHuman => write!(f, "escalate_human"),
        }
    }
}

/// Immutable outcome of the quality gate for one pass over a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub stage: String,
    /// Aggregate score in 0.0..=5.0.
    pub score: f64,
    pub threshold: f64,
    pub passed: bool,
    pub findings: String,
    pub decision: Decision,
    /// Revision pass this verdict was rendered on (0 for the first pass).
    pub revision: u32,
    pub rendered_at: DateTime<Utc>,
}

impl QualityVerdict {
    pub fn is_accept(&self) -> bool {
        self.decision == Decision::Accept
    }
}

impl std::fmt::Display for QualityVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:.2}/{:.2} -> {}",
            self.stage, self.score, self.threshold, self.decision
        )
    }
}
