//! InMemoryTaskStore - 開発・テスト用の正本
//!
//! `RecordTable` は純粋なテーブル操作（CAS 含む）で、FileTaskStore と共有します。

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::domain::{QueueCounts, StoreError, TaskId, TaskRecord, TaskStatus};
use crate::ports::TaskStore;

/// Plain record table with optimistic-concurrency writes.
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordTable {
    records: HashMap<TaskId, TaskRecord>,
}

impl RecordTable {
    pub(crate) fn from_records(records: impl IntoIterator<Item = TaskRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    /// All records, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<TaskRecord> {
        let mut all: Vec<TaskRecord> = self.records.values().cloned().collect();
        all.sort_by_key(|r| (r.created_at, r.id));
        all
    }

    pub(crate) fn insert(&mut self, mut record: TaskRecord) -> Result<TaskRecord, StoreError> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        record.version = 1;
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.records.get(&id).cloned()
    }

    pub(crate) fn update(&mut self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        let stored = self
            .records
            .get_mut(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;
        if stored.version != record.version {
            return Err(StoreError::Conflict {
                task_id: record.id,
                expected: record.version,
                actual: stored.version,
            });
        }
        let mut next = record.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    pub(crate) fn delete(&mut self, id: TaskId) -> bool {
        self.records.remove(&id).is_some()
    }

    pub(crate) fn list_by_status(&self, status: TaskStatus) -> Vec<TaskRecord> {
        let mut matching: Vec<TaskRecord> = self
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| (r.created_at, r.id));
        matching
    }

    pub(crate) fn prune_completed(&mut self, retain: usize) -> Vec<TaskId> {
        let mut completed: Vec<(chrono::DateTime<chrono::Utc>, TaskId)> = self
            .records
            .values()
            .filter(|r| r.status == TaskStatus::Completed)
            .map(|r| (r.created_at, r.id))
            .collect();
        if completed.len() <= retain {
            return Vec::new();
        }
        // newest first; everything past `retain` is at or before the cutoff
        completed.sort_by(|a, b| b.cmp(a));
        let mut doomed: Vec<TaskId> = completed.split_off(retain).into_iter().map(|(_, id)| id).collect();
        doomed.reverse();
        for id in &doomed {
            self.records.remove(id);
        }
        doomed
    }

    pub(crate) fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            counts.record(record.status);
        }
        counts
    }
}

pub struct InMemoryTaskStore {
    table: Mutex<RecordTable>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(RecordTable::default()),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, StoreError> {
        self.table.lock().await.insert(record)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.table.lock().await.get(id))
    }

    async fn update(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        self.table.lock().await.update(record)
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        Ok(self.table.lock().await.delete(id))
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.table.lock().await.list_by_status(status))
    }

    async fn prune_completed(&self, retain: usize) -> Result<Vec<TaskId>, StoreError> {
        Ok(self.table.lock().await.prune_completed(retain))
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        Ok(self.table.lock().await.counts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskPayload;
    use chrono::{Duration, Utc};
    use ulid::Ulid;

    fn record_at(offset_secs: i64) -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            TaskPayload::upscale(1, 1),
            Utc::now() + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = InMemoryTaskStore::new();
        let inserted = store.insert(record_at(0)).await.unwrap();

        let mut first = inserted.clone();
        first.mark_processing(Utc::now());
        let written = store.update(&first).await.unwrap();
        assert_eq!(written.version, inserted.version + 1);

        let mut second = inserted.clone();
        second.mark_canceled(Utc::now());
        let err = store.update(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let stored = store.get(inserted.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let store = InMemoryTaskStore::new();
        let record = record_at(0);
        store.insert(record.clone()).await.unwrap();
        assert!(matches!(
            store.insert(record).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn list_by_status_is_oldest_first() {
        let store = InMemoryTaskStore::new();
        let newer = store.insert(record_at(10)).await.unwrap();
        let older = store.insert(record_at(-10)).await.unwrap();

        let pending = store.list_by_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(
            pending.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![older.id, newer.id]
        );
    }

    #[tokio::test]
    async fn prune_keeps_the_most_recent_completed() {
        let store = InMemoryTaskStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut r = record_at(i);
            r.mark_completed(Utc::now());
            ids.push(store.insert(r).await.unwrap().id);
        }
        // not completed, never pruned
        let pending = store.insert(record_at(-100)).await.unwrap();

        let deleted = store.prune_completed(3).await.unwrap();

        assert_eq!(deleted, ids[..2].to_vec());
        assert!(store.get(pending.id).await.unwrap().is_some());
        assert_eq!(store.counts().await.unwrap().completed, 3);
    }
}
