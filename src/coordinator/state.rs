//! Coordination state and the task status machine.
//!
//! `CoordinationState` is exactly what a checkpoint stores: the task, the
//! active plan, every invocation issued for it, and every verdict rendered.
//! All transitions go through `transition`, which validates them against the
//! table in `can_transition` and appends to the task's history.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::analysis::ExecutionPlan;
use crate::core::invocation::{
    DelegateInvocation, ErrorKind, InvocationError, InvocationId,
};
use crate::core::task::{StageTransition, Task, TaskStatus};
use crate::core::verdict::QualityVerdict;
use crate::error::{Error, Result};

/// Why a task is parked or was stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum Blocker {
    /// The analyzer reported blocking issues.
    DependencyBlocked { stage: String, issues: String },
    /// The quality gate asked for a human.
    QualityEscalation { stage: String, score: f64 },
    /// Delegate failures or guard rejections used up the retry budget.
    RetriesExhausted { stage: String, last_error: String },
    /// An operator or caller cancelled the task.
    Cancelled,
    /// An operator aborted the task from review.
    Aborted { reason: Option<String> },
    /// Analyzer or gate fault.
    Internal { error: String },
    /// A checkpoint could not be written.
    CheckpointFailure { error: String },
    /// Final output assembly failed.
    SynthesisFailure { error: String },
}

impl std::fmt::Display for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Blocker::DependencyBlocked { stage, issues } => {
                write!(f, "dependency blocked in {}: {}", stage, issues)
            }
            Blocker::QualityEscalation { stage, score } => {
                write!(f, "quality review needed for {} (score {:.2})", stage, score)
            }
            Blocker::RetriesExhausted { stage, last_error } => {
                write!(f, "retries exhausted in {}: {}", stage, last_error)
            }
            Blocker::Cancelled => write!(f, "cancelled"),
            Blocker::Aborted { reason } => match reason {
                Some(r) => write!(f, "aborted by operator: {}", r),
                None => write!(f, "aborted by operator"),
            },
            Blocker::Internal { error } => write!(f, "internal engine error: {}", error),
            Blocker::CheckpointFailure { error } => write!(f, "checkpoint write failed: {}", error),
            Blocker::SynthesisFailure { error } => write!(f, "synthesis failed: {}", error),
        }
    }
}

/// Whether the status machine allows `from -> to`.
///
/// Beyond the main pipeline flow: every non-terminal status may move to
/// Escalated (cancellation, internal faults) or Failed (checkpoint failure).
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if from.is_terminal() {
        return false;
    }
    if matches!(to, Failed) || (matches!(to, Escalated) && from != Escalated) {
        return true;
    }
    matches!(
        (from, to),
        (Pending, Planning)
            | (Planning, Dispatching)
            | (Planning, HumanReview)
            | (Dispatching, AwaitingResults)
            | (Dispatching, Retrying)
            | (AwaitingResults, QualityCheck)
            | (AwaitingResults, Retrying)
            | (QualityCheck, Planning)
            | (QualityCheck, Dispatching)
            | (QualityCheck, Synthesizing)
            | (QualityCheck, HumanReview)
            | (HumanReview, Dispatching)
            | (Retrying, Planning)
            | (Synthesizing, Completed)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationState {
    pub task: Task,
    /// The one active plan for the task, replaced on every planning pass.
    pub plan: Option<ExecutionPlan>,
    pub invocations: Vec<DelegateInvocation>,
    pub verdicts: Vec<QualityVerdict>,
    /// Invocations issued in the current wave.
    pub wave: Vec<InvocationId>,
    pub blocker: Option<Blocker>,
}

impl CoordinationState {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            plan: None,
            invocations: Vec::new(),
            verdicts: Vec::new(),
            wave: Vec::new(),
            blocker: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    /// Move the task to `to`, recording the transition.
    pub fn transition(&mut self, to: TaskStatus, reason: Option<String>) -> Result<()> {
        let from = self.task.status;
        if !can_transition(from, to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        self.task.history.push(StageTransition {
            from,
            to,
            stage: self.task.current_stage_name().to_string(),
            reason,
            at: now,
        });
        self.task.status = to;
        self.task.updated_at = now;
        Ok(())
    }

    /// Park or stop with a cause that the status report will name.
    pub fn block(&mut self, blocker: Blocker) {
        self.task.blocking_reason = Some(blocker.to_string());
        self.blocker = Some(blocker);
    }

    pub fn unblock(&mut self) {
        self.task.blocking_reason = None;
        self.blocker = None;
    }

    /// Insert a new invocation or replace the record with the same id.
    pub fn upsert_invocation(&mut self, invocation: DelegateInvocation) {
        match self.invocations.iter_mut().find(|i| i.id == invocation.id) {
            Some(existing) => *existing = invocation,
            None => self.invocations.push(invocation),
        }
    }

    pub fn invocation(&self, id: InvocationId) -> Option<&DelegateInvocation> {
        self.invocations.iter().find(|i| i.id == id)
    }

    /// Invocations of the current wave.
    pub fn wave_invocations(&self) -> Vec<&DelegateInvocation> {
        self.wave
            .iter()
            .filter_map(|id| self.invocation(*id))
            .collect()
    }

    /// Close every open invocation as failed with `kind`. Returns how many
    /// were closed.
    pub fn close_open_invocations(&mut self, kind: ErrorKind, message: &str) -> usize {
        let mut closed = 0;
        for invocation in self.invocations.iter_mut().filter(|i| !i.is_closed()) {
            if invocation
                .fail(InvocationError::new(kind, message))
                .is_ok()
            {
                closed += 1;
            }
        }
        closed
    }

    pub fn last_verdict(&self) -> Option<&QualityVerdict> {
        self.verdicts.last()
    }

    pub fn verdicts_for(&self, stage: &str) -> Vec<&QualityVerdict> {
        self.verdicts.iter().filter(|v| v.stage == stage).collect()
    }

    /// Most recent closed invocation for a subtask.
    pub fn last_attempt(&self, subtask: &str) -> Option<&DelegateInvocation> {
        self.invocations
            .iter()
            .rev()
            .find(|i| i.subtask == subtask && i.is_closed())
    }
}
