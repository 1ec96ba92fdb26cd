//! Execution plans produced by the dependency analyzer.

use serde::{Deserialize, Serialize};

use crate::core::pipeline::SubtaskSpec;

/// A subtask selected for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSubtask {
    pub name: String,
    pub delegate: String,
    pub depends_on: Vec<String>,
}

impl From<&SubtaskSpec> for PlannedSubtask {
    fn from(spec: &SubtaskSpec) -> Self {
        Self {
            name: spec.name.clone(),
            delegate: spec.delegate.clone(),
            depends_on: spec.depends_on.clone(),
        }
    }
}

/// Why a subtask cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BlockReason {
    /// The dependency names no subtask in the pipeline.
    UnknownDependency { dependency: String },
    /// The dependency belongs to a stage that has not run yet.
    LaterStage { dependency: String, stage: String },
    /// The dependency belongs to an earlier stage but has no result.
    MissingUpstream { dependency: String, stage: String },
    /// The subtask sits on a dependency cycle.
    Cycle { members: Vec<String> },
    /// The dependency is itself blocked.
    BlockedDependency { dependency: String },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::UnknownDependency { dependency } => {
                write!(f, "unknown dependency '{}'", dependency)
            }
            BlockReason::LaterStage { dependency, stage } => {
                write!(f, "depends on '{}' from later stage '{}'", dependency, stage)
            }
            BlockReason::MissingUpstream { dependency, stage } => {
                write!(f, "no result for '{}' from stage '{}'", dependency, stage)
            }
            BlockReason::Cycle { members } => {
                write!(f, "dependency cycle: {}", members.join(" -> "))
            }
            BlockReason::BlockedDependency { dependency } => {
                write!(f, "depends on blocked subtask '{}'", dependency)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingIssue {
    pub subtask: String,
    pub reason: BlockReason,
}

impl std::fmt::Display for BlockingIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.subtask, self.reason)
    }
}

/// Plan for the remaining work of one stage.
///
/// `parallel` members have every dependency satisfied and may be dispatched
/// together. `sequential` members are in dependency order and become
/// dispatchable once the entries before them complete.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stage: String,
    pub parallel: Vec<PlannedSubtask>,
    pub sequential: Vec<PlannedSubtask>,
    pub blocking_issues: Vec<BlockingIssue>,
}

impl ExecutionPlan {
    pub fn is_blocked(&self) -> bool {
        !self.blocking_issues.is_empty()
    }

    /// Nothing left to run in this stage.
    pub fn is_empty(&self) -> bool {
        self.parallel.is_empty() && self.sequential.is_empty() && self.blocking_issues.is_empty()
    }

    pub fn blocking_summary(&self) -> String {
        self.blocking_issues
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn contains(&self, subtask: &str) -> bool {
        self.parallel
            .iter()
            .chain(self.sequential.iter())
            .any(|p| p.name == subtask)
    }
}
