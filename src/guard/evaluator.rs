//! Pre-dispatch guard rails.
//!
//! Every proposed invocation passes five independent checks: a payload
//! policy check plus four pattern checks over the actor's recent history.
//! The evaluator only reads the history; entries are appended by the invoker
//! when a dispatch is actually issued.

use serde::{Deserialize, Serialize};

use crate::core::invocation::InvocationPayload;
use crate::guard::history::{fingerprint, ActionHistory, ActorId, EntryOutcome};

pub const DEFAULT_CYCLE_THRESHOLD: usize = 3;
pub const DEFAULT_CYCLE_WINDOW: usize = 20;
pub const DEFAULT_ESCALATION_WINDOW: usize = 5;
pub const DEFAULT_STUCK_WINDOW: usize = 3;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Guard-rail thresholds, `[guard]` in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Ring buffer length per actor.
    pub history_capacity: usize,
    /// Reject once a fingerprint appeared more than this many times...
    pub cycle_threshold: usize,
    /// ...within this many most recent entries.
    pub cycle_window: usize,
    /// Entries (including the proposal) that must grow monotonically to count
    /// as thrashing.
    pub escalation_window: usize,
    /// Consecutive failures against one target that mark it stuck.
    pub stuck_window: usize,
    /// Case-insensitive terms that may not appear anywhere in a payload.
    pub blocked_terms: Vec<String>,
    pub max_payload_bytes: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            history_capacity: crate::guard::history::DEFAULT_HISTORY_CAPACITY,
            cycle_threshold: DEFAULT_CYCLE_THRESHOLD,
            cycle_window: DEFAULT_CYCLE_WINDOW,
            escalation_window: DEFAULT_ESCALATION_WINDOW,
            stuck_window: DEFAULT_STUCK_WINDOW,
            blocked_terms: Vec::new(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// A dispatch the coordinator would like to issue.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedInvocation {
    pub target: String,
    pub payload: InvocationPayload,
    pub fingerprint: u64,
}

impl ProposedInvocation {
    pub fn new(target: &str, payload: InvocationPayload) -> Self {
        let fingerprint = fingerprint(target, &payload);
        Self {
            target: target.to_string(),
            payload,
            fingerprint,
        }
    }
}

/// Which check a proposal failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "check")]
pub enum Violation {
    Policy { detail: String },
    ImmediateRepetition,
    CyclicalPattern { occurrences: usize, window: usize },
    EscalatingPattern { entries: usize },
    StuckPattern { failures: usize },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Policy { detail } => write!(f, "policy: {}", detail),
            Violation::ImmediateRepetition => {
                write!(f, "immediate repetition of the previous action")
            }
            Violation::CyclicalPattern { occurrences, window } => write!(
                f,
                "cyclical pattern: action seen {} times in last {} entries",
                occurrences, window
            ),
            Violation::EscalatingPattern { entries } => write!(
                f,
                "escalating pattern: payload or priority grew across {} attempts without success",
                entries
            ),
            Violation::StuckPattern { failures } => write!(
                f,
                "stuck pattern: last {} attempts against this target failed",
                failures
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardVerdict {
    pub approved: bool,
    pub reasons: Vec<String>,
    pub violations: Vec<Violation>,
}

impl GuardVerdict {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            approved: violations.is_empty(),
            reasons: violations.iter().map(|v| v.to_string()).collect(),
            violations,
        }
    }

    pub fn summary(&self) -> String {
        self.reasons.join("; ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct GuardRailEvaluator {
    config: GuardConfig,
}

impl GuardRailEvaluator {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Evaluate a proposal against policy and the actor's history.
    pub fn check(
        &self,
        actor: &ActorId,
        proposed: &ProposedInvocation,
        history: &ActionHistory,
    ) -> GuardVerdict {
        let mut violations = self.check_policy(proposed);
        violations.extend(self.check_immediate_repetition(actor, proposed, history));
        violations.extend(self.check_cyclical(actor, proposed, history));
        violations.extend(self.check_escalating(actor, proposed, history));
        violations.extend(self.check_stuck(actor, proposed, history));
        GuardVerdict::from_violations(violations)
    }

    fn check_policy(&self, proposed: &ProposedInvocation) -> Vec<Violation> {
        let mut found = Vec::new();
        let payload = &proposed.payload;

        if payload.description.trim().is_empty() {
            found.push(Violation::Policy {
                detail: "empty task description".to_string(),
            });
        }

        let size = payload.byte_len();
        if size > self.config.max_payload_bytes {
            found.push(Violation::Policy {
                detail: format!(
                    "payload is {} bytes, limit {}",
                    size, self.config.max_payload_bytes
                ),
            });
        }

        if !self.config.blocked_terms.is_empty() {
            let body = serde_json::to_string(payload)
                .unwrap_or_default()
                .to_lowercase();
            for term in &self.config.blocked_terms {
                if !term.is_empty() && body.contains(&term.to_lowercase()) {
                    found.push(Violation::Policy {
                        detail: format!("blocked term '{}'", term),
                    });
                }
            }
        }
        found
    }

    fn check_immediate_repetition(
        &self,
        actor: &ActorId,
        proposed: &ProposedInvocation,
        history: &ActionHistory,
    ) -> Option<Violation> {
        history
            .last(actor)
            .filter(|last| last.fingerprint == proposed.fingerprint)
            .map(|_| Violation::ImmediateRepetition)
    }

    fn check_cyclical(
        &self,
        actor: &ActorId,
        proposed: &ProposedInvocation,
        history: &ActionHistory,
    ) -> Option<Violation> {
        let occurrences = history
            .recent(actor, self.config.cycle_window)
            .iter()
            .filter(|e| e.fingerprint == proposed.fingerprint)
            .count();
        (occurrences > self.config.cycle_threshold).then_some(Violation::CyclicalPattern {
            occurrences,
            window: self.config.cycle_window,
        })
    }

    fn check_escalating(
        &self,
        actor: &ActorId,
        proposed: &ProposedInvocation,
        history: &ActionHistory,
    ) -> Option<Violation> {
        let window = self.config.escalation_window;
        if window < 2 {
            return None;
        }
        let previous = history.recent_for_target(actor, &proposed.target, window - 1);
        if previous.len() < window - 1
            || previous.iter().any(|e| e.outcome == EntryOutcome::Succeeded)
        {
            return None;
        }

        let mut sizes: Vec<usize> = previous.iter().map(|e| e.payload_bytes).collect();
        sizes.push(proposed.payload.byte_len());
        let mut ranks: Vec<u8> = previous.iter().map(|e| e.priority.rank()).collect();
        ranks.push(proposed.payload.priority.rank());

        let growing_size = sizes.windows(2).all(|w| w[1] > w[0]);
        let growing_priority =
            ranks.windows(2).all(|w| w[1] >= w[0]) && ranks.last() > ranks.first();

        (growing_size || growing_priority)
            .then_some(Violation::EscalatingPattern { entries: window })
    }

    fn check_stuck(
        &self,
        actor: &ActorId,
        proposed: &ProposedInvocation,
        history: &ActionHistory,
    ) -> Option<Violation> {
        let window = self.config.stuck_window;
        if window == 0 {
            return None;
        }
        let recent = history.recent_for_target(actor, &proposed.target, window);
        let stuck = recent.len() == window
            && recent.iter().all(|e| e.outcome == EntryOutcome::Failed);
        stuck.then_some(Violation::StuckPattern { failures: window })
    }
}
