//! Dependency analysis for the current stage of a task.
//!
//! The analyzer is a pure function of the task and its completed results: no
//! I/O, no clock, no hidden state. Re-running it on the same inputs always
//! yields an equal plan, which is what lets the coordinator re-plan freely on
//! every planning re-entry and after resumption.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::analysis::graph::SubtaskGraph;
use crate::analysis::plan::{BlockReason, BlockingIssue, ExecutionPlan, PlannedSubtask};
use crate::core::task::{SubtaskResult, Task};
use crate::error::{Error, Result};

/// Computes the execution plan for a task's current stage.
pub trait DependencyAnalyzer: Send + Sync {
    fn analyze(
        &self,
        task: &Task,
        completed: &BTreeMap<String, SubtaskResult>,
    ) -> Result<ExecutionPlan>;
}

/// Plans a stage from the dependencies declared in the task's pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageAnalyzer;

impl StageAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Classify a dependency that is not yet completed and not a pending
    /// member of the current stage.
    fn external_block(task: &Task, dependency: &str) -> BlockReason {
        match task.pipeline.locate(dependency) {
            None => BlockReason::UnknownDependency {
                dependency: dependency.to_string(),
            },
            Some((index, _)) if index > task.stage_index => BlockReason::LaterStage {
                dependency: dependency.to_string(),
                stage: task.pipeline.stages[index].name.clone(),
            },
            Some((index, _)) => BlockReason::MissingUpstream {
                dependency: dependency.to_string(),
                stage: task.pipeline.stages[index].name.clone(),
            },
        }
    }
}

impl DependencyAnalyzer for StageAnalyzer {
    fn analyze(
        &self,
        task: &Task,
        completed: &BTreeMap<String, SubtaskResult>,
    ) -> Result<ExecutionPlan> {
        let stage = task.current_stage().ok_or_else(|| {
            Error::InternalAnalyzerError(format!(
                "stage index {} out of range for {} stages",
                task.stage_index,
                task.pipeline.stages.len()
            ))
        })?;

        let remaining: Vec<PlannedSubtask> = stage
            .subtasks
            .iter()
            .filter(|s| !completed.contains_key(&s.name))
            .map(PlannedSubtask::from)
            .collect();
        let pending: HashSet<&str> = remaining.iter().map(|s| s.name.as_str()).collect();

        let mut issues: Vec<BlockingIssue> = Vec::new();
        let mut blocked: BTreeSet<String> = BTreeSet::new();

        // Dependencies outside the pending set must already have results.
        let mut graph = SubtaskGraph::new();
        for subtask in &remaining {
            graph.add_subtask(subtask.clone());
        }
        for subtask in &remaining {
            for dep in &subtask.depends_on {
                if completed.contains_key(dep) {
                    continue;
                }
                if pending.contains(dep.as_str()) {
                    graph.add_dependency(dep, &subtask.name)?;
                    continue;
                }
                if blocked.insert(subtask.name.clone()) {
                    issues.push(BlockingIssue {
                        subtask: subtask.name.clone(),
                        reason: Self::external_block(task, dep),
                    });
                }
            }
        }

        for members in graph.cycles() {
            for member in &members {
                if blocked.insert(member.clone()) {
                    issues.push(BlockingIssue {
                        subtask: member.clone(),
                        reason: BlockReason::Cycle {
                            members: members.clone(),
                        },
                    });
                }
            }
        }

        // Anything waiting on a blocked subtask is blocked as well.
        loop {
            let newly: Vec<(String, String)> = remaining
                .iter()
                .filter(|s| !blocked.contains(&s.name))
                .filter_map(|s| {
                    graph
                        .dependencies(&s.name)
                        .into_iter()
                        .find(|d| blocked.contains(*d))
                        .map(|d| (s.name.clone(), d.to_string()))
                })
                .collect();
            if newly.is_empty() {
                break;
            }
            for (name, dependency) in newly {
                blocked.insert(name.clone());
                issues.push(BlockingIssue {
                    subtask: name,
                    reason: BlockReason::BlockedDependency { dependency },
                });
            }
        }

        let mut schedulable = SubtaskGraph::new();
        for subtask in remaining.iter().filter(|s| !blocked.contains(&s.name)) {
            schedulable.add_subtask(subtask.clone());
        }
        for subtask in remaining.iter().filter(|s| !blocked.contains(&s.name)) {
            for dep in &subtask.depends_on {
                if schedulable.contains(dep) {
                    schedulable.add_dependency(dep, &subtask.name)?;
                }
            }
        }

        let parallel: Vec<PlannedSubtask> = schedulable
            .ready(&HashSet::new())
            .into_iter()
            .cloned()
            .collect();
        let ready: HashSet<&str> = parallel.iter().map(|p| p.name.as_str()).collect();
        let sequential: Vec<PlannedSubtask> = schedulable
            .topological_order()?
            .into_iter()
            .filter(|s| !ready.contains(s.name.as_str()))
            .cloned()
            .collect();

        Ok(ExecutionPlan {
            stage: stage.name.clone(),
            parallel,
            sequential,
            blocking_issues: issues,
        })
    }
}
