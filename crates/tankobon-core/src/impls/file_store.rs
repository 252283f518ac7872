//! FileTaskStore - JSON スナップショットで永続化する正本
//!
//! 全レコードをメモリに保持し、変更のたびにファイル全体を書き直します
//! （一時ファイルへ書いて rename）。再起動後は `open` で読み戻します。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::memory_store::RecordTable;
use crate::domain::{QueueCounts, StoreError, TaskId, TaskRecord, TaskStatus};
use crate::ports::TaskStore;

pub struct FileTaskStore {
    path: PathBuf,
    table: Mutex<RecordTable>,
}

impl FileTaskStore {
    /// Open (or create) the snapshot at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let records: Vec<TaskRecord> = serde_json::from_slice(&bytes)?;
                debug!(path = %path.display(), records = records.len(), "loaded task store");
                RecordTable::from_records(records)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RecordTable::default(),
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &RecordTable) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&table.snapshot())?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `op` to a copy of the table and only swap it in once the
    /// snapshot is on disk, so memory never runs ahead of the file.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut RecordTable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.table.lock().await;
        let mut next = guard.clone();
        let out = op(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(out)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, StoreError> {
        self.mutate(|t| t.insert(record)).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.table.lock().await.get(id))
    }

    async fn update(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        self.mutate(|t| t.update(record)).await
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        self.mutate(|t| Ok(t.delete(id))).await
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.table.lock().await.list_by_status(status))
    }

    async fn prune_completed(&self, retain: usize) -> Result<Vec<TaskId>, StoreError> {
        self.mutate(|t| Ok(t.prune_completed(retain))).await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        Ok(self.table.lock().await.counts())
    }
}
