//! TaskPersistence - 状態遷移のゲートウェイ
//!
//! 業務ロジックは持たず、store に対する claim / complete / fail / cancel だけを扱います。
//!
//! # 設計原則
//! - `claim` は Pending → Processing の唯一の入口（at-most-one executor）
//! - 楽観的並行制御の競合は「他の誰かが取った」として `false` を返す
//! - complete / fail / cancel は呼び出し側が claim 済みである前提の無条件書き込み

use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{
    Result, StoreError, TankobonError, TaskId, TaskProgress, TaskRecord, TaskStatus,
};
use crate::ports::{Clock, TaskStore};

use super::status::StatusNotifier;

/// Retries for unconditional writes that lose a race with a progress save.
const WRITE_ATTEMPTS: u32 = 5;

pub struct TaskPersistence {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    notifier: StatusNotifier,
    claim_attempts: u32,
}

impl TaskPersistence {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        notifier: StatusNotifier,
        claim_attempts: u32,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            claim_attempts: claim_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Atomically move `id` from Pending to Processing.
    ///
    /// Returns `Ok(false)` when the record is gone, no longer Pending, or
    /// every write lost an optimistic-concurrency race.
    pub async fn claim(&self, id: TaskId) -> Result<bool> {
        for attempt in 1..=self.claim_attempts {
            let Some(mut record) = self.store.get(id).await? else {
                debug!(task_id = %id, "claim: record missing");
                return Ok(false);
            };
            if !record.status.is_claimable() {
                debug!(task_id = %id, status = %record.status, "claim: not pending");
                return Ok(false);
            }

            record.mark_processing(self.clock.now());
            match self.store.update(&record).await {
                Ok(_) => {
                    self.notifier.status_changed(id, TaskStatus::Processing);
                    return Ok(true);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(task_id = %id, attempt, "claim: lost write race");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    pub async fn complete(&self, id: TaskId) -> Result<TaskRecord> {
        self.transition(id, |r, now| r.mark_completed(now)).await
    }

    pub async fn fail(&self, id: TaskId, error: impl Into<String>) -> Result<TaskRecord> {
        let error = error.into();
        self.transition(id, move |r, now| r.mark_failed(error.clone(), now))
            .await
    }

    /// Cancel `id`; with `requeue` the record goes back to Pending instead.
    pub async fn cancel(&self, id: TaskId, requeue: bool) -> Result<TaskRecord> {
        if requeue {
            self.transition(id, |r, now| r.requeue(now)).await
        } else {
            self.transition(id, |r, now| r.mark_canceled(now)).await
        }
    }

    /// Store the latest progress without touching status.
    ///
    /// Only applies while the record is Processing; a lost race is ignored.
    pub async fn save_progress(&self, id: TaskId, progress: &TaskProgress) -> Result<()> {
        let Some(mut record) = self.store.get(id).await? else {
            return Ok(());
        };
        if record.status != TaskStatus::Processing || record.progress == *progress {
            return Ok(());
        }
        record.progress = progress.clone();
        match self.store.update(&record).await {
            Ok(_) | Err(StoreError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn transition(
        &self,
        id: TaskId,
        apply: impl Fn(&mut TaskRecord, chrono::DateTime<chrono::Utc>),
    ) -> Result<TaskRecord> {
        for _ in 0..WRITE_ATTEMPTS {
            let mut record = self
                .store
                .get(id)
                .await?
                .ok_or(TankobonError::NotFound(id))?;
            apply(&mut record, self.clock.now());
            match self.store.update(&record).await {
                Ok(written) => {
                    self.notifier.status_changed(id, written.status);
                    return Ok(written);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        warn!(task_id = %id, "status write kept conflicting");
        Err(TankobonError::Other(format!(
            "task {id}: status write kept conflicting"
        )))
    }
}
