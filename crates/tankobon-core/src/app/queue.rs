//! TaskQueue - タスク投入の唯一の入口
//!
//! レコードを store に永続化してから、種別に対応するレーンへ TaskId を push します。
//! レーンは配送ヒントにすぎず、状態の正本は常に store です。

use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::{Lane, QueueCounts, Result, TaskId, TaskPayload, TaskRecord, TaskStatus};
use crate::ports::{Clock, DeliveryQueue, IdGenerator, TaskStore};

use super::persistence::TaskPersistence;
use super::status::StatusNotifier;

pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    delivery: Arc<dyn DeliveryQueue>,
    persistence: Arc<TaskPersistence>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    notifier: StatusNotifier,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        delivery: Arc<dyn DeliveryQueue>,
        persistence: Arc<TaskPersistence>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        notifier: StatusNotifier,
    ) -> Self {
        Self {
            store,
            delivery,
            persistence,
            ids,
            clock,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn delivery(&self) -> &Arc<dyn DeliveryQueue> {
        &self.delivery
    }

    pub fn persistence(&self) -> &Arc<TaskPersistence> {
        &self.persistence
    }

    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    /// Persist a Pending record and route its id to the payload's lane.
    ///
    /// Returns once the record is stored, not once it has run.
    pub async fn enqueue(&self, payload: TaskPayload) -> Result<TaskRecord> {
        let record = TaskRecord::new(self.ids.generate_task_id(), payload, self.clock.now());
        let record = self.store.insert(record).await?;
        let lane = record.payload.lane();
        self.delivery.push(lane, record.id).await;

        debug!(task_id = %record.id, kind = %record.payload.kind(), %lane, "enqueued");
        self.notifier.status_changed(record.id, TaskStatus::Pending);
        Ok(record)
    }

    /// Drop a task that has not started yet.
    ///
    /// Returns false when the record is missing or already past Pending.
    pub async fn remove_task(&self, id: TaskId) -> Result<bool> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(false);
        };
        if record.status != TaskStatus::Pending {
            debug!(task_id = %id, status = %record.status, "remove skipped");
            return Ok(false);
        }
        self.delivery.remove(id).await;
        let removed = self.store.delete(id).await?;
        if removed {
            debug!(task_id = %id, "removed pending task");
        }
        Ok(removed)
    }

    /// Re-push an existing record's id onto its lane without a new record.
    ///
    /// Failed and Canceled records are reset to Pending first; Processing
    /// and Completed records are left alone and `false` is returned.
    pub async fn retry(&self, id: TaskId) -> Result<bool> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(false);
        };
        match record.status {
            TaskStatus::Pending => {}
            TaskStatus::Failed | TaskStatus::Canceled => {
                self.persistence.cancel(id, true).await?;
            }
            TaskStatus::Processing | TaskStatus::Completed => return Ok(false),
        }
        self.delivery.push(record.payload.lane(), id).await;
        debug!(task_id = %id, "retry pushed");
        Ok(true)
    }

    /// Push onto the rerouted lane so only the local upscale loop sees it.
    pub async fn send_to_local_upscale(&self, id: TaskId) {
        self.delivery.push(Lane::Rerouted, id).await;
    }

    /// Startup recovery: nothing can hold a Processing record after a
    /// restart, so reset those and re-push every Pending record.
    pub async fn recover(&self) -> Result<usize> {
        for stale in self.store.list_by_status(TaskStatus::Processing).await? {
            self.persistence.cancel(stale.id, true).await?;
        }

        let pending = self.store.list_by_status(TaskStatus::Pending).await?;
        for record in &pending {
            self.delivery.push(record.payload.lane(), record.id).await;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "recovered pending tasks");
        }
        Ok(pending.len())
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        Ok(self.store.counts().await?)
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.store.get(id).await?)
    }
}
