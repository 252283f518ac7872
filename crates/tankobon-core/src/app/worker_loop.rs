//! LocalProcessor - レーンごとの単一コンシューマループ
//!
//! # フロー
//! 1. DeliveryQueue::pop() で TaskId を取得（複数レーンは先頭優先）
//! 2. TaskPersistence::claim() で Pending → Processing（負けたら黙って捨てる）
//! 3. HandlerRegistry で種別ごとのハンドラを CancellationToken 付きで実行
//! 4. 進捗は debounce して StatusNotifier へ転送
//! 5. 結果に応じて Completed / Canceled / Failed、shutdown 中のキャンセルは Pending へ戻す
//!    （store への書き込みが失敗したら backoff しながら再試行する）
//!
//! claim はスロットのロックを持ったまま行い、`cancel(id)` は同じロックの中で
//! id を比較してからキャンセルします。claim 直後のキャンセルも取りこぼさず、
//! スロットが別のタスクに入れ替わった後に誤って止めることもありません。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Lane, ProgressHandle, TankobonError, TaskId};

use super::queue::TaskQueue;
use super::runtime::{HandlerRegistry, TaskContext};
use super::status::StatusNotifier;

/// Attempts at writing a task's final status before giving up.
const SETTLE_ATTEMPTS: u32 = 5;
const SETTLE_BACKOFF: Duration = Duration::from_millis(50);

enum Settlement {
    Complete,
    Cancel,
    Requeue,
    Fail(String),
}

struct Running {
    task_id: TaskId,
    token: CancellationToken,
}

pub struct LocalProcessor {
    name: &'static str,
    lanes: Vec<Lane>,
    queue: Arc<TaskQueue>,
    registry: Arc<HandlerRegistry>,
    notifier: StatusNotifier,
    current: Mutex<Option<Running>>,
    poll_interval: Duration,
    debounce: Duration,
}

impl LocalProcessor {
    pub fn new(
        name: &'static str,
        lanes: Vec<Lane>,
        queue: Arc<TaskQueue>,
        registry: Arc<HandlerRegistry>,
        notifier: StatusNotifier,
    ) -> Self {
        Self {
            name,
            lanes,
            queue,
            registry,
            notifier,
            current: Mutex::new(None),
            poll_interval: Duration::from_secs(1),
            debounce: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::domain::TaskEvent> {
        self.notifier.subscribe()
    }

    /// Id of the task this loop is executing right now.
    pub async fn current(&self) -> Option<TaskId> {
        self.current.lock().await.as_ref().map(|r| r.task_id)
    }

    /// Cancel `id` if, and only if, it is the task currently running here.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let guard = self.current.lock().await;
        match guard.as_ref() {
            Some(running) if running.task_id == id => {
                running.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Consume the lanes until `shutdown` fires.
    ///
    /// A task running at shutdown is canceled and put back to Pending.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(processor = self.name, lanes = ?self.lanes, "local processor started");
        loop {
            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = self.queue.delivery().pop(&self.lanes, self.poll_interval) => popped,
            };
            let Some((lane, id)) = popped else {
                continue;
            };
            self.process(lane, id, &shutdown).await;
        }
        info!(processor = self.name, "local processor stopped");
    }

    async fn process(&self, lane: Lane, id: TaskId, shutdown: &CancellationToken) {
        let token = shutdown.child_token();
        {
            // cancel(id) はここで待たされるので claim 直後の取りこぼしがない
            let mut slot = self.current.lock().await;
            match self.queue.persistence().claim(id).await {
                Ok(true) => {
                    *slot = Some(Running {
                        task_id: id,
                        token: token.clone(),
                    });
                }
                Ok(false) => {
                    debug!(processor = self.name, task_id = %id, "claim lost, dropping handle");
                    return;
                }
                Err(e) => {
                    drop(slot);
                    warn!(
                        processor = self.name,
                        task_id = %id,
                        error = %e,
                        "claim failed, handle pushed back"
                    );
                    tokio::time::sleep(self.poll_interval).await;
                    self.queue.delivery().push(lane, id).await;
                    return;
                }
            }
        }

        let record = match self.queue.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                *self.current.lock().await = None;
                debug!(processor = self.name, task_id = %id, "record vanished after claim");
                return;
            }
            Err(e) => {
                *self.current.lock().await = None;
                warn!(
                    processor = self.name,
                    task_id = %id,
                    error = %e,
                    "record unreadable after claim"
                );
                self.settle(lane, id, Settlement::Requeue).await;
                return;
            }
        };

        let ctx = TaskContext {
            task_id: id,
            payload: record.payload,
            progress: ProgressHandle::new(record.progress),
            cancel: token.clone(),
        };
        let stop = CancellationToken::new();
        let forwarder = self.spawn_forwarder(id, &ctx.progress, stop.clone());

        debug!(processor = self.name, task_id = %id, kind = %ctx.payload.kind(), "executing");
        let result = tokio::select! {
            result = self.registry.execute(&ctx) => result,
            _ = token.cancelled() => Err(TankobonError::Canceled),
        };

        *self.current.lock().await = None;
        stop.cancel();
        let _ = forwarder.await;

        let settlement = match result {
            Ok(()) => Settlement::Complete,
            Err(e) if e.is_canceled() && shutdown.is_cancelled() => Settlement::Requeue,
            Err(e) if e.is_canceled() => Settlement::Cancel,
            Err(e) => {
                warn!(processor = self.name, task_id = %id, error = %e, "task failed");
                Settlement::Fail(e.to_string())
            }
        };
        self.settle(lane, id, settlement).await;
    }

    /// Write the final status, backing off and retrying while the store errors.
    ///
    /// A record that still cannot be written stays Processing until
    /// `TaskQueue::recover` runs on the next start.
    async fn settle(&self, lane: Lane, id: TaskId, settlement: Settlement) {
        let persistence = self.queue.persistence();
        let mut backoff = SETTLE_BACKOFF;
        for attempt in 1..=SETTLE_ATTEMPTS {
            let written = match &settlement {
                Settlement::Complete => persistence.complete(id).await,
                Settlement::Cancel => persistence.cancel(id, false).await,
                Settlement::Requeue => persistence.cancel(id, true).await,
                Settlement::Fail(message) => persistence.fail(id, message.as_str()).await,
            };
            match written {
                Ok(record) => {
                    if matches!(settlement, Settlement::Requeue) {
                        self.queue.delivery().push(lane, id).await;
                    }
                    debug!(
                        processor = self.name,
                        task_id = %id,
                        status = %record.status,
                        "settled"
                    );
                    return;
                }
                Err(TankobonError::NotFound(_)) => {
                    debug!(processor = self.name, task_id = %id, "record gone before settling");
                    return;
                }
                Err(e) => {
                    warn!(
                        processor = self.name,
                        task_id = %id,
                        attempt,
                        error = %e,
                        "status write failed"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        warn!(processor = self.name, task_id = %id, "status write abandoned, left Processing");
    }

    /// Forward progress changes, at most once per debounce window.
    ///
    /// On `stop` the latest snapshot is flushed once more before exiting.
    fn spawn_forwarder(
        &self,
        id: TaskId,
        progress: &ProgressHandle,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = progress.subscribe();
        let notifier = self.notifier.clone();
        let persistence = self.queue.persistence().clone();
        let debounce = self.debounce;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(debounce) => {}
                }

                let snapshot = rx.borrow_and_update().clone();
                notifier.progress_changed(id, snapshot.clone());
                if let Err(e) = persistence.save_progress(id, &snapshot).await {
                    debug!(task_id = %id, error = %e, "progress not saved");
                }
                if stop.is_cancelled() {
                    break;
                }
            }
        })
    }
}
