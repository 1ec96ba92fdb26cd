//! Final output assembly.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::coordinator::state::CoordinationState;
use crate::core::task::SubtaskResult;
use crate::error::{Error, Result};

/// Assembles a completed task's output from its accepted results.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, state: &CoordinationState) -> Result<Value>;
}

/// Builds a JSON report: per-stage results and verdicts plus the merged
/// `artifacts` map.
///
/// Subtask results may carry an `artifacts` object. Artifacts are merged in
/// completion order, so when two results name the same artifact the one
/// that completed last wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportSynthesizer;

impl ReportSynthesizer {
    pub fn merge_artifacts<'a>(results: impl IntoIterator<Item = &'a SubtaskResult>) -> Map<String, Value> {
        let mut ordered: Vec<&SubtaskResult> = results.into_iter().collect();
        ordered.sort_by_key(|r| r.completed_at);

        let mut merged = Map::new();
        for result in ordered {
            if let Some(artifacts) = result.payload.get("artifacts").and_then(Value::as_object) {
                for (name, value) in artifacts {
                    merged.insert(name.clone(), value.clone());
                }
            }
        }
        merged
    }
}

#[async_trait]
impl Synthesizer for ReportSynthesizer {
    async fn synthesize(&self, state: &CoordinationState) -> Result<Value> {
        let task = &state.task;
        let mut stages = Vec::new();

        for stage in &task.pipeline.stages {
            let mut results = Map::new();
            for subtask in &stage.subtasks {
                let result = task.results.get(&subtask.name).ok_or_else(|| {
                    Error::Synthesis(format!(
                        "no result for subtask '{}' of stage '{}'",
                        subtask.name, stage.name
                    ))
                })?;
                results.insert(subtask.name.clone(), result.payload.clone());
            }
            let verdict = state.verdicts_for(&stage.name).last().map(|v| {
                json!({
                    "score": v.score,
                    "decision": v.decision,
                    "revision": v.revision,
                })
            });
            stages.push(json!({
                "name": stage.name,
                "results": results,
                "verdict": verdict,
            }));
        }

        Ok(json!({
            "task_id": task.id,
            "description": task.description,
            "priority": task.priority,
            "stages": stages,
            "artifacts": Self::merge_artifacts(task.results.values()),
            "final_score": state.last_verdict().map(|v| v.score),
        }))
    }
}
