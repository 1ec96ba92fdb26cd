//! Stage pipeline definitions.
//!
//! The pipeline is the fixed, ordered list of stages a task moves through.
//! Each stage names the subtasks its teams run and what each subtask needs
//! from earlier work.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default stage order for a task.
pub const DEFAULT_STAGES: [&str; 4] = ["research", "analysis", "writing", "rating"];

/// One unit of work inside a stage, dispatched to a single delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Unique across the whole pipeline; results are keyed by this name.
    pub name: String,
    /// Delegate (team or worker) that runs this subtask.
    pub delegate: String,
    /// Subtasks whose results must exist before this one may run.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl SubtaskSpec {
    pub fn new(name: &str, delegate: &str) -> Self {
        Self {
            name: name.to_string(),
            delegate: delegate.to_string(),
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, dependency: &str) -> Self {
        self.depends_on.push(dependency.to_string());
        self
    }
}

/// A sequential phase of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub subtasks: Vec<SubtaskSpec>,
}

impl StageSpec {
    pub fn new(name: &str, subtasks: Vec<SubtaskSpec>) -> Self {
        Self {
            name: name.to_string(),
            subtasks,
        }
    }

    pub fn subtask(&self, name: &str) -> Option<&SubtaskSpec> {
        self.subtasks.iter().find(|s| s.name == name)
    }
}

/// Ordered stage pipeline carried by every task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub stages: Vec<StageSpec>,
}

impl Pipeline {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    /// A single-stage pipeline with one subtask, handy for small jobs.
    pub fn single(stage: &str, delegate: &str) -> Self {
        Self::new(vec![StageSpec::new(
            stage,
            vec![SubtaskSpec::new(stage, delegate)],
        )])
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Find a subtask anywhere in the pipeline with its stage index.
    pub fn locate(&self, subtask: &str) -> Option<(usize, &SubtaskSpec)> {
        self.stages.iter().enumerate().find_map(|(i, stage)| {
            stage.subtask(subtask).map(|spec| (i, spec))
        })
    }

    /// Every delegate name referenced by the pipeline, deduplicated in order.
    pub fn delegates(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.stages
            .iter()
            .flat_map(|s| s.subtasks.iter())
            .filter(|s| seen.insert(s.delegate.clone()))
            .map(|s| s.delegate.clone())
            .collect()
    }

    /// Structural validation performed when a task is accepted.
    ///
    /// Dependency satisfiability is the analyzer's concern; this only rejects
    /// pipelines that can never be meaningful.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::Validation("pipeline has no stages".to_string()));
        }

        let mut stage_names = HashSet::new();
        let mut subtask_names = HashSet::new();
        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
            if stage.subtasks.is_empty() {
                return Err(Error::Validation(format!(
                    "stage {} has no subtasks",
                    stage.name
                )));
            }
            for subtask in &stage.subtasks {
                if !subtask_names.insert(subtask.name.as_str()) {
                    return Err(Error::Validation(format!(
                        "duplicate subtask name: {}",
                        subtask.name
                    )));
                }
                if subtask.delegate.trim().is_empty() {
                    return Err(Error::Validation(format!(
                        "subtask {} has no delegate",
                        subtask.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for Pipeline {
    /// research -> analysis -> writing -> rating, one team per stage, each
    /// stage consuming the previous stage's output.
    fn default() -> Self {
        let mut stages = Vec::with_capacity(DEFAULT_STAGES.len());
        let mut previous: Option<&str> = None;
        for name in DEFAULT_STAGES {
            let mut subtask = SubtaskSpec::new(name, &format!("{}_team", name));
            if let Some(prev) = previous {
                subtask = subtask.after(prev);
            }
            stages.push(StageSpec::new(name, vec![subtask]));
            previous = Some(name);
        }
        Self { stages }
    }
}
