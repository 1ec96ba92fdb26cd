//! Human review: the package sent to an operator and the decision they
//! send back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::coordinator::state::{Blocker, CoordinationState};
use crate::core::task::{SubtaskResult, TaskId, TaskStatus};
use crate::core::verdict::QualityVerdict;
use crate::error::{Error, Result};
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    /// Re-plan the current stage with fresh budgets.
    Resume,
    /// Stop work; the task moves to Escalated.
    Abort,
    /// Resume after merging the supplied context and results.
    Modify,
    /// Close the task as Failed.
    Fail,
}

impl std::fmt::Display for ReviewAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewAction::Resume => write!(f, "resume"),
            ReviewAction::Abort => write!(f, "abort"),
            ReviewAction::Modify => write!(f, "modify"),
            ReviewAction::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for ReviewAction {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "resume" => Ok(ReviewAction::Resume),
            "abort" => Ok(ReviewAction::Abort),
            "modify" => Ok(ReviewAction::Modify),
            "fail" => Ok(ReviewAction::Fail),
            other => Err(Error::Validation(format!("unknown review action: {}", other))),
        }
    }
}

/// Operator decision.
///
/// For `modify`, `payload` may hold `context` (merged into the task
/// context) and `results` (`{subtask: {payload, sub_score?}}`, injected as
/// completed work). For `abort` an optional `reason` string is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub action: ReviewAction,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl ReviewDecision {
    pub fn new(action: ReviewAction) -> Self {
        Self {
            action,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Free-text `reason` from the payload, recorded on abort.
    pub fn reason(&self) -> Option<String> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Everything an operator needs to decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewPackage {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub task_summary: String,
    pub blocking_reason: Option<String>,
    /// Completed results keyed by subtask.
    pub stage_results: BTreeMap<String, Value>,
    pub verdict_history: Vec<QualityVerdict>,
    pub recommendations: Vec<String>,
    pub notes: Vec<String>,
}

pub fn build_package(state: &CoordinationState) -> ReviewPackage {
    let task = &state.task;
    let task_summary = format!(
        "{} [{}] stage {}/{} ({}), {} result(s), {} invocation(s)",
        task.description,
        task.priority,
        task.stage_index + 1,
        task.pipeline.stages.len(),
        task.current_stage_name(),
        task.results.len(),
        state.invocations.len()
    );

    ReviewPackage {
        task_id: task.id,
        status: task.status,
        task_summary,
        blocking_reason: task.blocking_reason.clone(),
        stage_results: task
            .results
            .iter()
            .map(|(name, r)| (name.clone(), r.payload.clone()))
            .collect(),
        verdict_history: state.verdicts.clone(),
        recommendations: recommendations(state),
        notes: task.notes.clone(),
    }
}

fn recommendations(state: &CoordinationState) -> Vec<String> {
    let mut out = Vec::new();
    match &state.blocker {
        Some(Blocker::DependencyBlocked { issues, .. }) => {
            out.push(format!("Unmet dependencies: {}", issues));
            out.push("Use `modify` with the missing upstream results, then the stage is re-planned".to_string());
            out.push("Use `abort` if the pipeline itself is wrong".to_string());
        }
        Some(Blocker::QualityEscalation { stage, score }) => {
            out.push(format!(
                "Stage {} scored {:.2}; read the verdict findings before deciding",
                stage, score
            ));
            out.push("Use `resume` to re-run the stage with a fresh revision budget".to_string());
            out.push("Use `modify` to inject corrected results or extra context".to_string());
        }
        Some(Blocker::RetriesExhausted { last_error, .. }) => {
            out.push(format!("Last failure: {}", last_error));
            out.push("Check delegate health; `fail` closes the task".to_string());
        }
        Some(Blocker::Internal { error }) => {
            out.push(format!("Engine fault: {}", error));
            out.push("Inspect the log before failing the task".to_string());
        }
        Some(_) => out.push("Use `fail` to close the task".to_string()),
        None => {}
    }
    out
}

/// Apply a resume or modify decision to `state` in place.
///
/// Resets the current stage's retry and revision budgets. After a quality
/// escalation the stage results are withdrawn so the stage runs again.
pub fn prepare_resume(state: &mut CoordinationState, decision: &ReviewDecision) -> Result<()> {
    if matches!(state.blocker, Some(Blocker::QualityEscalation { .. })) {
        state.task.withdraw_stage_results();
    }

    if decision.action == ReviewAction::Modify {
        let payload = decision.payload.as_ref().ok_or_else(|| {
            Error::Validation("modify needs a payload with context or results".to_string())
        })?;
        apply_modification(state, payload)?;
    }

    let stage = state.task.current_stage_name().to_string();
    state.task.stage_retries = 0;
    state.task.revisions.remove(&stage);
    state.task.note(format!("operator {} at stage {}", decision.action, stage));
    Ok(())
}

fn apply_modification(state: &mut CoordinationState, payload: &Value) -> Result<()> {
    if let Some(context) = payload.get("context") {
        let merged = match (state.task.context.as_object(), context.as_object()) {
            (Some(existing), Some(update)) => {
                let mut merged = existing.clone();
                merged.extend(update.clone());
                Value::Object(merged)
            }
            _ => context.clone(),
        };
        state.task.context = merged;
    }

    if let Some(results) = payload.get("results") {
        let results = results
            .as_object()
            .ok_or_else(|| Error::Validation("modify results must be an object".to_string()))?;
        for (subtask, entry) in results {
            let (stage_index, spec) = state.task.pipeline.locate(subtask).ok_or_else(|| {
                Error::Validation(format!("unknown subtask in modify: {}", subtask))
            })?;
            if stage_index > state.task.stage_index {
                return Err(Error::Validation(format!(
                    "subtask {} belongs to a later stage",
                    subtask
                )));
            }
            let result = SubtaskResult {
                stage: state.task.pipeline.stages[stage_index].name.clone(),
                delegate: spec.delegate.clone(),
                invocation_id: None,
                payload: entry.get("payload").cloned().unwrap_or(Value::Null),
                sub_score: entry.get("sub_score").and_then(Value::as_f64),
                completed_at: Utc::now(),
            };
            state.task.record_result(subtask, result);
        }
    }
    Ok(())
}
