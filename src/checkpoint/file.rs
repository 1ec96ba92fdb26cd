//! Directory-backed checkpoint store.
//!
//! Layout: `<root>/<task_id>/<sequence:010>.json`. Each checkpoint is written
//! to a `.tmp` sibling, synced, then hard-linked into place. A crash mid-write
//! leaves only the temp file, which readers ignore, and the link fails rather
//! than overwrite an existing checkpoint.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::checkpoint::store::{check_sequence, Checkpoint, CheckpointStore};
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::clog_debug;

#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    /// Serializes appends so the sequence check and the write are atomic.
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, task_id: TaskId) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    fn file_name(sequence: u64) -> String {
        format!("{:010}.json", sequence)
    }

    fn temp_name(sequence: u64) -> String {
        format!("{:010}.json.tmp", sequence)
    }

    /// Sequence numbers on disk for a task, ascending.
    async fn sequences(&self, task_id: TaskId) -> Result<Vec<u64>> {
        let dir = self.task_dir(task_id);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir).await?;
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(seq) = stem.parse::<u64>() {
                found.push(seq);
            }
        }
        found.sort_unstable();
        Ok(found)
    }

    async fn read(&self, task_id: TaskId, sequence: u64) -> Result<Checkpoint> {
        let path = self.task_dir(task_id).join(Self::file_name(sequence));
        let text = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn append(&self, task_id: TaskId, checkpoint: Checkpoint) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let current = self.sequences(task_id).await?.last().copied();
        check_sequence(task_id, &checkpoint, current)?;

        let dir = self.task_dir(task_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(Self::file_name(checkpoint.sequence));
        let body = serde_json::to_vec_pretty(&checkpoint)?;

        let temp = dir.join(Self::temp_name(checkpoint.sequence));
        let write_failed =
            |e: std::io::Error| Error::CheckpointWriteFailed(format!("{}: {}", path.display(), e));

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .await
            .map_err(write_failed)?;
        file.write_all(&body).await.map_err(write_failed)?;
        file.sync_all().await.map_err(write_failed)?;
        drop(file);

        let linked = fs::hard_link(&temp, &path).await;
        let _ = fs::remove_file(&temp).await;
        linked.map_err(write_failed)?;
        #[cfg(unix)]
        if let Ok(handle) = fs::File::open(&dir).await {
            let _ = handle.sync_all().await;
        }

        clog_debug!(
            "Checkpoint {} written for task {} ({} bytes)",
            checkpoint.sequence,
            task_id.short(),
            body.len()
        );
        Ok(checkpoint.sequence)
    }

    async fn latest(&self, task_id: TaskId) -> Result<Option<Checkpoint>> {
        match self.sequences(task_id).await?.last() {
            Some(&seq) => Ok(Some(self.read(task_id, seq).await?)),
            None => Ok(None),
        }
    }

    async fn history(&self, task_id: TaskId) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for seq in self.sequences(task_id).await? {
            checkpoints.push(self.read(task_id, seq).await?);
        }
        Ok(checkpoints)
    }

    async fn task_ids(&self) -> Result<Vec<TaskId>> {
        if !fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<TaskId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
