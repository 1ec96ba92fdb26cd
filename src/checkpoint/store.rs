//! Append-only checkpoint persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::state::CoordinationState;
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Durable snapshot of everything needed to resume a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: TaskId,
    /// Starts at 1 and increases by exactly one per write.
    pub sequence: u64,
    pub state: CoordinationState,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(sequence: u64, state: CoordinationState) -> Self {
        Self {
            task_id: state.task.id,
            sequence,
            state,
            written_at: Utc::now(),
        }
    }
}

/// Keyed-by-task, append-only checkpoint log.
///
/// Implementations must reject any write whose sequence is not exactly one
/// past the current latest, and must never modify a written checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint, returning its sequence number.
    async fn append(&self, task_id: TaskId, checkpoint: Checkpoint) -> Result<u64>;

    /// The checkpoint with the highest sequence number, if any.
    async fn latest(&self, task_id: TaskId) -> Result<Option<Checkpoint>>;

    /// Every checkpoint for a task, oldest first.
    async fn history(&self, task_id: TaskId) -> Result<Vec<Checkpoint>>;

    /// Tasks with at least one checkpoint.
    async fn task_ids(&self) -> Result<Vec<TaskId>>;
}

/// Shared validation for `append`.
pub(crate) fn check_sequence(
    task_id: TaskId,
    checkpoint: &Checkpoint,
    current: Option<u64>,
) -> Result<()> {
    if checkpoint.task_id != task_id {
        return Err(Error::Validation(format!(
            "checkpoint for task {} appended under {}",
            checkpoint.task_id, task_id
        )));
    }
    let expected = current.unwrap_or(0) + 1;
    if checkpoint.sequence != expected {
        return Err(Error::CheckpointSequence {
            task: task_id.to_string(),
            expected,
            got: checkpoint.sequence,
        });
    }
    Ok(())
}
