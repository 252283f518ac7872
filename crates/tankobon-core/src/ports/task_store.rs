//! TaskStore port - タスクレコードの正本（source of truth）
//!
//! 要求するのは行の読み書き、compare-and-swap 付き更新、
//! status / 作成時刻による単純な条件クエリだけです。

use async_trait::async_trait;

use crate::domain::{QueueCounts, StoreError, TaskId, TaskRecord, TaskStatus};

/// Durable task record store.
///
/// # 設計原則
/// - `update` は `record.version` が保存済みの version と一致する場合のみ成功する
///   （一致しなければ `StoreError::Conflict`）。成功時は version を進めたレコードを返す。
/// - Pending -> Processing の排他はこの CAS だけで保証される（分散ロック不要）。
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Compare-and-swap write keyed on `record.version`.
    async fn update(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError>;

    /// Returns `false` when there was nothing to delete.
    async fn delete(&self, id: TaskId) -> Result<bool, StoreError>;

    /// Records with the given status, oldest first.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError>;

    /// Retention sweep over `Completed` records.
    ///
    /// Takes the creation time of the `retain`-th most recent completed record
    /// as the boundary and deletes every completed record strictly older than
    /// it (ties broken by id), atomically with respect to other writers.
    /// Returns the deleted ids, oldest first.
    async fn prune_completed(&self, retain: usize) -> Result<Vec<TaskId>, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}
