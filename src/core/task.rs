//! Task data model for the coordination engine.
//!
//! A task is one accepted request moving through the stage pipeline. It is
//! mutated only by the coordinator; terminal states are Completed and Failed.

use crate::core::pipeline::{Pipeline, StageSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::invocation::InvocationId;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Declared task priority. Ordered so escalation checks can compare ranks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(crate::Error::Validation(format!("unknown priority: {}", other))),
        }
    }
}

/// Coordinator status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Planning,
    Dispatching,
    AwaitingResults,
    QualityCheck,
    HumanReview,
    Retrying,
    Escalated,
    Synthesizing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Parked states wait for an operator; no driver runs while parked.
    pub fn is_parked(&self) -> bool {
        matches!(self, TaskStatus::HumanReview | TaskStatus::Escalated)
    }

    /// Whether a driver should be stepping this task.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !self.is_parked()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Dispatching => "dispatching",
            TaskStatus::AwaitingResults => "awaiting_results",
            TaskStatus::QualityCheck => "quality_check",
            TaskStatus::HumanReview => "human_review",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Escalated => "escalated",
            TaskStatus::Synthesizing => "synthesizing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One entry in the ordered transition history of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// Pipeline stage the task was on when the transition happened.
    pub stage: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Aggregated result of a subtask, keyed by subtask name on the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub stage: String,
    pub delegate: String,
    /// Invocation that produced this result. `None` when supplied by a reviewer.
    pub invocation_id: Option<InvocationId>,
    pub payload: Value,
    pub sub_score: Option<f64>,
    pub completed_at: DateTime<Utc>,
}

/// A task accepted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub priority: Priority,
    /// Caller-supplied context merged into every delegate payload.
    pub context: Value,
    pub status: TaskStatus,
    pub pipeline: Pipeline,
    /// Index into `pipeline.stages` of the stage being worked.
    pub stage_index: usize,
    pub history: Vec<StageTransition>,
    pub results: BTreeMap<String, SubtaskResult>,
    /// Retries consumed by the current stage.
    pub stage_retries: u32,
    /// Revision passes consumed, per stage name.
    pub revisions: BTreeMap<String, u32>,
    /// Guard-rail rejections and other operator-facing notes, oldest first.
    pub notes: Vec<String>,
    /// Set while parked in HumanReview or Escalated, or after failure.
    pub blocking_reason: Option<String>,
    /// Final synthesized output once Completed.
    pub output: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: &str, priority: Priority, context: Value, pipeline: Pipeline) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            description: description.to_string(),
            priority,
            context,
            status: TaskStatus::Pending,
            pipeline,
            stage_index: 0,
            history: Vec::new(),
            results: BTreeMap::new(),
            stage_retries: 0,
            revisions: BTreeMap::new(),
            notes: Vec::new(),
            blocking_reason: None,
            output: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// The stage currently being worked, if the pipeline has one at `stage_index`.
    pub fn current_stage(&self) -> Option<&StageSpec> {
        self.pipeline.stages.get(self.stage_index)
    }

    pub fn current_stage_name(&self) -> &str {
        self.current_stage().map(|s| s.name.as_str()).unwrap_or("")
    }

    pub fn is_final_stage(&self) -> bool {
        self.stage_index + 1 >= self.pipeline.stages.len()
    }

    pub fn revisions_used(&self, stage: &str) -> u32 {
        self.revisions.get(stage).copied().unwrap_or(0)
    }

    /// Whether every subtask of the current stage has a result.
    pub fn current_stage_complete(&self) -> bool {
        self.current_stage()
            .map(|stage| {
                stage
                    .subtasks
                    .iter()
                    .all(|s| self.results.contains_key(&s.name))
            })
            .unwrap_or(false)
    }

    /// Withdraw the current stage's results so it can be re-dispatched.
    pub fn withdraw_stage_results(&mut self) -> Vec<String> {
        let names: Vec<String> = self
            .current_stage()
            .map(|stage| stage.subtasks.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default();
        names
            .into_iter()
            .filter(|name| self.results.remove(name).is_some())
            .collect()
    }

    pub fn record_result(&mut self, subtask: &str, result: SubtaskResult) {
        self.results.insert(subtask.to_string(), result);
        self.updated_at = Utc::now();
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
        self.updated_at = Utc::now();
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
