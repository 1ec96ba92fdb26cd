use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::checkpoint::store::{check_sequence, Checkpoint, CheckpointStore};
use crate::core::task::TaskId;
use crate::error::Result;

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    logs: RwLock<HashMap<TaskId, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append(&self, task_id: TaskId, checkpoint: Checkpoint) -> Result<u64> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(task_id).or_default();
        check_sequence(task_id, &checkpoint, log.last().map(|c| c.sequence))?;
        let sequence = checkpoint.sequence;
        log.push(checkpoint);
        Ok(sequence)
    }

    async fn latest(&self, task_id: TaskId) -> Result<Option<Checkpoint>> {
        Ok(self
            .logs
            .read()
            .await
            .get(&task_id)
            .and_then(|log| log.last().cloned()))
    }

    async fn history(&self, task_id: TaskId) -> Result<Vec<Checkpoint>> {
        Ok(self
            .logs
            .read()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn task_ids(&self) -> Result<Vec<TaskId>> {
        let mut ids: Vec<TaskId> = self.logs.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
