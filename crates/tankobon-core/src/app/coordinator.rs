//! DistributedCoordinator - remote worker 向けの upscale レーン
//!
//! # プロトコル
//! `fetch` → (`heartbeat` | `apply_progress`)* → `complete` | `fail`
//!
//! # 設計原則
//! - lease と repair state はコーディネーターごとの `CoordinatorState` に置き、
//!   1 つの Mutex で守る（グローバルなマップは持たない）
//! - Pending → Processing は store の楽観的並行制御（`TaskPersistence::claim`）で守る
//! - heartbeat が grace を超えて途絶えた lease は reaper が回収し、
//!   store 上でまだ Processing のものだけを Pending に戻して再配送する
//! - ロックを持ったまま store やファイルシステムを await しない
//! - 取り出した後の claim から lease までは spawn したタスクで走らせる
//!   （呼び出し側が切断しても Processing のまま宙に浮かない）
//! - store への書き込みに失敗した lease は捨てずに戻し、reaper の次の周回で再試行する

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{
    Lane, ProgressHandle, ProgressUpdate, Result, TankobonError, TaskEvent, TaskId, TaskPayload,
    TaskProgress, TaskRecord, TaskStatus, UpscalePayload,
};
use crate::ports::{ChapterChangedNotifier, ChapterInspector, RepairPlan, UpscaleCheck};

use super::queue::TaskQueue;
use super::repair::{RepairDelegator, RepairOutcome, RepairState};
use super::status::StatusNotifier;

/// Where a remote worker picks up and drops off a repair bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAssignment {
    pub bundle_path: PathBuf,
    pub result_path: PathBuf,
    pub missing_pages: u64,
}

/// Response to a successful `fetch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedTask {
    pub task_id: TaskId,
    pub payload: TaskPayload,
    pub progress: TaskProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairAssignment>,
}

struct Lease {
    payload: TaskPayload,
    last_heartbeat: DateTime<Utc>,
    progress: ProgressHandle,
}

#[derive(Default)]
struct CoordinatorState {
    leases: HashMap<TaskId, Lease>,
    repairs: HashMap<TaskId, RepairState>,
}

impl CoordinatorState {
    fn take(&mut self, id: TaskId) -> (Option<Lease>, Option<RepairState>) {
        (self.leases.remove(&id), self.repairs.remove(&id))
    }
}

pub struct DistributedCoordinator {
    queue: Arc<TaskQueue>,
    inspector: Arc<dyn ChapterInspector>,
    repair: RepairDelegator,
    chapters: Arc<dyn ChapterChangedNotifier>,
    notifier: StatusNotifier,
    state: Mutex<CoordinatorState>,
    lease_grace: chrono::Duration,
    lease_skew: chrono::Duration,
    fetch_wait: Duration,
}

impl DistributedCoordinator {
    pub fn new(
        queue: Arc<TaskQueue>,
        inspector: Arc<dyn ChapterInspector>,
        repair: RepairDelegator,
        chapters: Arc<dyn ChapterChangedNotifier>,
        notifier: StatusNotifier,
    ) -> Self {
        Self {
            queue,
            inspector,
            repair,
            chapters,
            notifier,
            state: Mutex::new(CoordinatorState::default()),
            lease_grace: chrono::Duration::seconds(60),
            lease_skew: chrono::Duration::seconds(5),
            fetch_wait: Duration::from_secs(30),
        }
    }

    pub fn with_lease_timing(mut self, grace: Duration, skew: Duration) -> Self {
        self.lease_grace = to_chrono(grace);
        self.lease_skew = to_chrono(skew);
        self
    }

    /// Upper bound on how long one `fetch` may wait for work.
    pub fn with_fetch_wait(mut self, fetch_wait: Duration) -> Self {
        self.fetch_wait = fetch_wait;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.notifier.subscribe()
    }

    fn now(&self) -> DateTime<Utc> {
        self.queue.persistence().clock().now()
    }

    /// Ids currently leased to remote workers.
    pub async fn leased(&self) -> Vec<TaskId> {
        let state = self.state.lock().await;
        let mut ids: Vec<TaskId> = state.leases.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn progress(&self, id: TaskId) -> Option<TaskProgress> {
        let state = self.state.lock().await;
        state.leases.get(&id).map(|lease| lease.progress.snapshot())
    }

    /// Hand the next delegatable upscale-lane task to a remote worker.
    ///
    /// Waits at most `timeout`, capped at the configured fetch wait;
    /// `Ok(None)` means the caller should retry.
    pub async fn fetch(self: &Arc<Self>, timeout: Duration) -> Result<Option<FetchedTask>> {
        let deadline = Instant::now() + timeout.min(self.fetch_wait);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some((_, id)) = self.queue.delivery().pop(&[Lane::Upscale], remaining).await
            else {
                return Ok(None);
            };

            // 取り出した後は呼び出し側が future を捨てても lease まで進める
            let this = Arc::clone(self);
            match tokio::spawn(async move { this.hand_off(id).await }).await {
                Ok(Ok(Some(fetched))) => return Ok(Some(fetched)),
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(TankobonError::Other(format!("hand-off of {id} aborted: {e}")));
                }
            }
        }
    }

    /// Claim a popped id and lease it, or resolve it without a worker.
    ///
    /// A read or claim error pushes the id back onto the upscale lane.
    async fn hand_off(&self, id: TaskId) -> Result<Option<FetchedTask>> {
        let record = match self.queue.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(task_id = %id, "fetch: record vanished");
                return Ok(None);
            }
            Err(e) => {
                self.queue.delivery().push(Lane::Upscale, id).await;
                return Err(e);
            }
        };
        if record.payload.is_local_only() {
            debug!(task_id = %id, kind = %record.payload.kind(), "fetch: rerouted to local");
            self.queue.send_to_local_upscale(id).await;
            return Ok(None);
        }
        match self.queue.persistence().claim(id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %id, "fetch: claim lost");
                return Ok(None);
            }
            Err(e) => {
                self.queue.delivery().push(Lane::Upscale, id).await;
                return Err(e);
            }
        }

        let payload = record.payload.clone();
        match self.admit(record).await {
            Ok(fetched) => Ok(fetched),
            Err(e) => {
                warn!(task_id = %id, error = %e, "fetch: task could not be prepared");
                if let Err(write) = self.queue.persistence().fail(id, e.to_string()).await {
                    warn!(
                        task_id = %id,
                        error = %write,
                        "fetch: failure not recorded, left to the reaper"
                    );
                    self.park(id, payload).await;
                }
                Ok(None)
            }
        }
    }

    /// Run the pre-delegation checks on a claimed record.
    ///
    /// `Ok(None)` means the task was resolved locally and nothing is leased.
    async fn admit(&self, record: TaskRecord) -> Result<Option<FetchedTask>> {
        let id = record.id;
        match record.payload.clone() {
            TaskPayload::Upscale(payload) => {
                if !self.upscale_needed(id, &payload).await? {
                    return Ok(None);
                }
                Ok(Some(self.lease(record, None).await))
            }
            TaskPayload::RepairUpscale(payload) => {
                match self.repair.prepare(id, &payload).await? {
                    RepairPlan::NoChange => {
                        info!(task_id = %id, "repair: nothing to repair");
                        self.queue.persistence().complete(id).await?;
                        Ok(None)
                    }
                    RepairPlan::Unrepairable { reason } => {
                        let replacement = self
                            .queue
                            .enqueue(TaskPayload::Upscale(UpscalePayload {
                                chapter_id: payload.chapter_id,
                                profile_id: payload.profile_id,
                            }))
                            .await?;
                        info!(
                            task_id = %id,
                            replacement = %replacement.id,
                            %reason,
                            "repair: superseded by full upscale"
                        );
                        self.queue.persistence().complete(id).await?;
                        Ok(None)
                    }
                    RepairPlan::Repairable(bundle) => {
                        let state = RepairState { payload, bundle };
                        Ok(Some(self.lease(record, Some(state)).await))
                    }
                }
            }
            _ => Ok(Some(self.lease(record, None).await)),
        }
    }

    /// Fast-path check; resolves the task itself when nothing needs doing.
    async fn upscale_needed(&self, id: TaskId, payload: &UpscalePayload) -> Result<bool> {
        match self.inspector.check_upscale(payload).await? {
            UpscaleCheck::Needed => Ok(true),
            UpscaleCheck::AlreadySatisfied => {
                debug!(task_id = %id, chapter = %payload.chapter_id, "upscale already satisfied");
                self.queue.persistence().complete(id).await?;
                Ok(false)
            }
            UpscaleCheck::SourceMissing => {
                warn!(task_id = %id, chapter = %payload.chapter_id, "upscale source missing");
                self.queue
                    .persistence()
                    .fail(id, format!("source archive for {} is missing", payload.chapter_id))
                    .await?;
                Ok(false)
            }
        }
    }

    async fn lease(&self, record: TaskRecord, repair: Option<RepairState>) -> FetchedTask {
        let id = record.id;
        let progress = ProgressHandle::new(record.progress);
        let assignment = repair.as_ref().map(|state| {
            progress.set_total(state.bundle.missing_pages);
            progress.set_unit("pages");
            RepairAssignment {
                bundle_path: state.bundle.bundle_path.clone(),
                result_path: state.bundle.result_path.clone(),
                missing_pages: state.bundle.missing_pages,
            }
        });
        let fetched = FetchedTask {
            task_id: id,
            payload: record.payload.clone(),
            progress: progress.snapshot(),
            repair: assignment,
        };

        let mut state = self.state.lock().await;
        state.leases.insert(
            id,
            Lease {
                payload: record.payload,
                last_heartbeat: self.now() + self.lease_skew,
                progress,
            },
        );
        if let Some(repair) = repair {
            state.repairs.insert(id, repair);
        }
        drop(state);

        info!(task_id = %id, "leased to remote worker");
        fetched
    }

    /// Track a claimed task nobody works on under an already expired lease,
    /// so the next reap puts it back on the lane.
    async fn park(&self, id: TaskId, payload: TaskPayload) {
        let expired = self.now() - self.lease_grace - chrono::Duration::seconds(1);
        self.state.lock().await.leases.entry(id).or_insert(Lease {
            payload,
            last_heartbeat: expired,
            progress: ProgressHandle::default(),
        });
    }

    /// Put a lease back after its status write failed.
    async fn restore(&self, id: TaskId, lease: Lease, repair: Option<RepairState>) {
        let mut state = self.state.lock().await;
        state.leases.entry(id).or_insert(lease);
        if let Some(repair) = repair {
            state.repairs.entry(id).or_insert(repair);
        }
    }

    /// Refresh the lease; `false` tells the worker to stop and discard its result.
    pub async fn heartbeat(&self, id: TaskId) -> bool {
        let now = self.now();
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&id) {
            Some(lease) => {
                lease.last_heartbeat = lease.last_heartbeat.max(now);
                true
            }
            None => false,
        }
    }

    /// Merge a partial progress report; also counts as a heartbeat.
    pub async fn apply_progress(&self, id: TaskId, update: &ProgressUpdate) -> bool {
        let now = self.now();
        let snapshot = {
            let mut state = self.state.lock().await;
            let Some(lease) = state.leases.get_mut(&id) else {
                return false;
            };
            lease.last_heartbeat = lease.last_heartbeat.max(now);
            lease.progress.apply(update);
            lease.progress.snapshot()
        };

        self.notifier.progress_changed(id, snapshot.clone());
        if let Err(e) = self.queue.persistence().save_progress(id, &snapshot).await {
            debug!(task_id = %id, error = %e, "progress not saved");
        }
        true
    }

    /// Remote success. Repair tasks run their merge phase first and are only
    /// marked Completed if it succeeds; repair files are removed either way.
    ///
    /// When the status write itself fails the lease is kept, so the worker
    /// may retry or the reaper recovers the task.
    pub async fn complete(&self, id: TaskId) -> Result<()> {
        let (lease, repair) = self.state.lock().await.take(id);
        let Some(lease) = lease else {
            if let Some(state) = repair {
                self.repair.cleanup(id, &state.bundle).await;
            }
            return Err(TankobonError::LeaseNotFound(id));
        };

        let chapter_id = match &lease.payload {
            TaskPayload::RepairUpscale(payload) => Some(payload.chapter_id),
            _ => None,
        };
        let Some(chapter_id) = chapter_id else {
            if let Err(e) = self.queue.persistence().complete(id).await {
                self.restore(id, lease, repair).await;
                return Err(e);
            }
            info!(task_id = %id, "remote task completed");
            return Ok(());
        };

        let Some(state) = repair else {
            warn!(task_id = %id, "repair completed without prepared state");
            let written = self
                .queue
                .persistence()
                .fail(id, TankobonError::RepairStateMissing(id).to_string())
                .await;
            if let Err(e) = written {
                self.restore(id, lease, None).await;
                return Err(e);
            }
            return Err(TankobonError::RepairStateMissing(id));
        };

        let outcome = self.repair.finish(&state).await;
        self.repair.cleanup(id, &state.bundle).await;

        let written = match &outcome {
            Ok(RepairOutcome::Merged) => {
                self.chapters.chapter_changed(chapter_id);
                info!(task_id = %id, "repair merged");
                self.queue.persistence().complete(id).await
            }
            Ok(RepairOutcome::NoLongerNeeded) => {
                info!(task_id = %id, "repair no longer needed, bundle discarded");
                self.queue.persistence().complete(id).await
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "repair merge failed");
                self.queue.persistence().fail(id, e.to_string()).await
            }
        };
        if let Err(e) = written {
            self.restore(id, lease, None).await;
            return Err(e);
        }
        outcome.map(|_| ())
    }

    /// Remote failure.
    pub async fn fail(&self, id: TaskId, message: &str) -> Result<()> {
        let (lease, repair) = self.state.lock().await.take(id);
        if let Some(state) = repair {
            self.repair.cleanup(id, &state.bundle).await;
        }
        let Some(lease) = lease else {
            return Err(TankobonError::LeaseNotFound(id));
        };
        warn!(task_id = %id, error = message, "remote task failed");
        if let Err(e) = self.queue.persistence().fail(id, message).await {
            self.restore(id, lease, None).await;
            return Err(e);
        }
        Ok(())
    }

    /// Cancel a leased task. Returns false when `id` is not leased here.
    ///
    /// The worker learns about it on its next heartbeat.
    pub async fn cancel(&self, id: TaskId) -> Result<bool> {
        let (lease, repair) = self.state.lock().await.take(id);
        if let Some(state) = repair {
            self.repair.cleanup(id, &state.bundle).await;
        }
        let Some(lease) = lease else {
            return Ok(false);
        };
        if let Err(e) = self.queue.persistence().cancel(id, false).await {
            self.restore(id, lease, None).await;
            return Err(e);
        }
        info!(task_id = %id, "remote task canceled");
        Ok(true)
    }

    /// Drop leases whose heartbeat is older than the grace window and put
    /// their tasks back on the upscale lane.
    ///
    /// A task the store already shows as finished is not requeued. An entry
    /// whose store access fails keeps its expired lease for the next pass.
    pub async fn reap_dead_leases(&self) -> Vec<TaskId> {
        let now = self.now();
        let expired: Vec<(TaskId, Lease, Option<RepairState>)> = {
            let mut state = self.state.lock().await;
            let dead: Vec<TaskId> = state
                .leases
                .iter()
                .filter(|(_, lease)| now - lease.last_heartbeat > self.lease_grace)
                .map(|(id, _)| *id)
                .collect();
            dead.into_iter()
                .filter_map(|id| {
                    let (lease, repair) = state.take(id);
                    lease.map(|lease| (id, lease, repair))
                })
                .collect()
        };

        let mut requeued = Vec::new();
        for (id, lease, repair) in expired {
            match self.requeue_expired(id).await {
                Ok(moved) => {
                    if let Some(state) = repair {
                        self.repair.cleanup(id, &state.bundle).await;
                    }
                    if moved {
                        requeued.push(id);
                    }
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "reap: store unavailable, retrying next pass");
                    self.restore(id, lease, repair).await;
                }
            }
        }
        requeued
    }

    /// `Ok(false)` when the record is gone or already settled.
    async fn requeue_expired(&self, id: TaskId) -> Result<bool> {
        let Some(record) = self.queue.get(id).await? else {
            debug!(task_id = %id, "reap: record gone");
            return Ok(false);
        };
        if record.status != TaskStatus::Processing {
            debug!(task_id = %id, status = %record.status, "reap: already settled");
            return Ok(false);
        }
        self.queue.persistence().cancel(id, true).await?;
        self.queue.delivery().push(record.payload.lane(), id).await;
        info!(task_id = %id, "reaped dead lease, task requeued");
        Ok(true)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::queue::tests::{FlakyStore, queue_on, queue_with};
    use crate::app::repair::tests::{FakeAnalyzer, FakePlan};
    use crate::domain::{ChapterId, RenamePayload, ProfileId};
    use crate::ports::{Clock, FixedClock};
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;

    struct FakeInspector {
        check: std::sync::Mutex<UpscaleCheck>,
        delay: Duration,
    }

    impl FakeInspector {
        fn new(check: UpscaleCheck) -> Self {
            Self {
                check: std::sync::Mutex::new(check),
                delay: Duration::ZERO,
            }
        }

        fn slow(check: UpscaleCheck, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(check)
            }
        }
    }

    #[async_trait]
    impl ChapterInspector for FakeInspector {
        async fn check_upscale(&self, _payload: &UpscalePayload) -> Result<UpscaleCheck> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(*self.check.lock().unwrap())
        }
    }

    #[derive(Default)]
    struct RecordingChapters(std::sync::Mutex<Vec<ChapterId>>);

    impl ChapterChangedNotifier for RecordingChapters {
        fn chapter_changed(&self, chapter_id: ChapterId) {
            self.0.lock().unwrap().push(chapter_id);
        }
    }

    struct Harness {
        clock: Arc<FixedClock>,
        queue: Arc<TaskQueue>,
        coordinator: Arc<DistributedCoordinator>,
        analyzer: Arc<FakeAnalyzer>,
        chapters: Arc<RecordingChapters>,
        _work: tempfile::TempDir,
    }

    fn harness(check: UpscaleCheck, plan: FakePlan) -> Harness {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let queue = queue_with(clock.clone() as Arc<dyn Clock>);
        harness_on(clock, queue, FakeInspector::new(check), plan)
    }

    fn harness_on(
        clock: Arc<FixedClock>,
        queue: Arc<TaskQueue>,
        inspector: FakeInspector,
        plan: FakePlan,
    ) -> Harness {
        let work = tempfile::tempdir().unwrap();
        let analyzer = Arc::new(FakeAnalyzer::new(plan));
        let chapters = Arc::new(RecordingChapters::default());
        let coordinator = DistributedCoordinator::new(
            queue.clone(),
            Arc::new(inspector),
            RepairDelegator::new(analyzer.clone(), work.path()),
            chapters.clone(),
            queue.notifier().clone(),
        )
        .with_lease_timing(Duration::from_secs(60), Duration::from_secs(5));
        Harness {
            clock,
            queue,
            coordinator: Arc::new(coordinator),
            analyzer,
            chapters,
            _work: work,
        }
    }

    fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = Arc::new(FlakyStore::default());
        let queue = queue_on(store.clone(), clock.clone() as Arc<dyn Clock>);
        let h = harness_on(
            clock,
            queue,
            FakeInspector::new(UpscaleCheck::Needed),
            FakePlan::NoChange,
        );
        (h, store)
    }

    const WAIT: Duration = Duration::from_millis(50);

    async fn status(queue: &TaskQueue, id: TaskId) -> TaskStatus {
        queue.get(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn end_to_end_remote_upscale() {
        let h = harness(UpscaleCheck::Needed, FakePlan::NoChange);
        let mut events = h.coordinator.subscribe();
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();

        let fetched = h.coordinator.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(fetched.task_id, task.id);
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Processing);

        h.clock.advance(chrono::Duration::seconds(5));
        assert!(h.coordinator.heartbeat(task.id).await);
        assert!(
            h.coordinator
                .apply_progress(task.id, &ProgressUpdate::counts(20, 10))
                .await
        );

        let observed = loop {
            if let TaskEvent::ProgressChanged { task_id, progress } = events.recv().await.unwrap()
                && task_id == task.id
            {
                break progress;
            }
        };
        assert_eq!((observed.total, observed.current), (20, 10));

        h.coordinator.complete(task.id).await.unwrap();

        let record = h.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.processed_at.is_some());
        assert!(h.coordinator.leased().await.is_empty());
    }

    #[tokio::test]
    async fn fetch_times_out_when_empty() {
        let h = harness(UpscaleCheck::Needed, FakePlan::NoChange);
        assert!(h.coordinator.fetch(WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn already_satisfied_upscale_is_never_delegated() {
        let h = harness(UpscaleCheck::AlreadySatisfied, FakePlan::NoChange);
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();

        assert!(h.coordinator.fetch(WAIT).await.unwrap().is_none());
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Completed);
        assert!(h.coordinator.leased().await.is_empty());
    }

    #[tokio::test]
    async fn missing_source_fails_task() {
        let h = harness(UpscaleCheck::SourceMissing, FakePlan::NoChange);
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();

        assert!(h.coordinator.fetch(WAIT).await.unwrap().is_none());
        let record = h.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn local_only_kinds_are_rerouted() {
        let h = harness(UpscaleCheck::Needed, FakePlan::NoChange);
        let rename = h
            .queue
            .enqueue(TaskPayload::RenameUpscaled(RenamePayload {
                chapter_id: ChapterId(7),
                profile_id: ProfileId(1),
                new_file_name: "Vol.02 Ch.007.cbz".into(),
            }))
            .await
            .unwrap();
        let upscale = h.queue.enqueue(TaskPayload::upscale(8, 1)).await.unwrap();

        let fetched = h.coordinator.fetch(WAIT).await.unwrap().unwrap();

        assert_eq!(fetched.task_id, upscale.id);
        assert_eq!(status(&h.queue, rename.id).await, TaskStatus::Pending);
        assert_eq!(
            h.queue.delivery().pop(&[Lane::Rerouted], WAIT).await,
            Some((Lane::Rerouted, rename.id))
        );
    }

    #[tokio::test]
    async fn dead_lease_is_requeued_exactly_once() {
        let h = harness(UpscaleCheck::Needed, FakePlan::NoChange);
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();
        h.coordinator.fetch(WAIT).await.unwrap().unwrap();

        h.clock.advance(chrono::Duration::seconds(30));
        assert!(h.coordinator.reap_dead_leases().await.is_empty());

        h.clock.advance(chrono::Duration::seconds(40));
        assert_eq!(h.coordinator.reap_dead_leases().await, vec![task.id]);
        assert!(h.coordinator.reap_dead_leases().await.is_empty());

        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Pending);
        assert_eq!(h.queue.delivery().len(Lane::Upscale).await, 1);
        assert!(!h.coordinator.heartbeat(task.id).await);

        let again = h.coordinator.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(again.task_id, task.id);
    }

    #[tokio::test]
    async fn settled_task_is_not_requeued_by_reaper() {
        let h = harness(UpscaleCheck::Needed, FakePlan::NoChange);
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();
        h.coordinator.fetch(WAIT).await.unwrap().unwrap();

        // completion lands in the store just before the reaper looks
        h.queue.persistence().complete(task.id).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(5));

        assert!(h.coordinator.reap_dead_leases().await.is_empty());
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Completed);
        assert_eq!(h.queue.delivery().len(Lane::Upscale).await, 0);
    }

    #[tokio::test]
    async fn repair_is_delegated_then_merged() {
        let h = harness(UpscaleCheck::Needed, FakePlan::Repairable(4));
        let task = h.queue.enqueue(TaskPayload::repair(7, 1)).await.unwrap();

        let fetched = h.coordinator.fetch(WAIT).await.unwrap().unwrap();
        let assignment = fetched.repair.unwrap();
        assert_eq!(assignment.missing_pages, 4);
        assert_eq!(fetched.progress.total, 4);
        assert!(assignment.bundle_path.exists());

        h.coordinator.complete(task.id).await.unwrap();

        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Completed);
        assert_eq!(h.analyzer.merges.load(Ordering::SeqCst), 1);
        assert_eq!(*h.chapters.0.lock().unwrap(), vec![ChapterId(7)]);
        assert!(!assignment.bundle_path.exists());
    }

    #[tokio::test]
    async fn repair_short_circuits_when_no_longer_needed() {
        let h = harness(UpscaleCheck::Needed, FakePlan::Repairable(4));
        let task = h.queue.enqueue(TaskPayload::repair(7, 1)).await.unwrap();
        let fetched = h.coordinator.fetch(WAIT).await.unwrap().unwrap();
        let assignment = fetched.repair.unwrap();

        h.analyzer.still_needed.store(false, Ordering::SeqCst);
        h.coordinator.complete(task.id).await.unwrap();

        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Completed);
        assert_eq!(h.analyzer.merges.load(Ordering::SeqCst), 0);
        assert!(h.chapters.0.lock().unwrap().is_empty());
        assert!(!assignment.bundle_path.exists());
    }

    #[tokio::test]
    async fn failed_merge_is_not_completed_and_files_are_removed() {
        let h = harness(UpscaleCheck::Needed, FakePlan::Repairable(4));
        let task = h.queue.enqueue(TaskPayload::repair(7, 1)).await.unwrap();
        let assignment = h.coordinator.fetch(WAIT).await.unwrap().unwrap().repair.unwrap();

        h.analyzer.fail_merge.store(true, Ordering::SeqCst);
        assert!(h.coordinator.complete(task.id).await.is_err());

        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Failed);
        assert!(!assignment.bundle_path.exists());
    }

    #[tokio::test]
    async fn repair_without_difference_completes_without_delegation() {
        let h = harness(UpscaleCheck::Needed, FakePlan::NoChange);
        let task = h.queue.enqueue(TaskPayload::repair(7, 1)).await.unwrap();

        assert!(h.coordinator.fetch(WAIT).await.unwrap().is_none());
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn unrepairable_repair_is_superseded_by_full_upscale() {
        let h = harness(UpscaleCheck::Needed, FakePlan::Unrepairable);
        let task = h.queue.enqueue(TaskPayload::repair(7, 1)).await.unwrap();

        // the replacement upscale is what gets delegated
        let fetched = h.coordinator.fetch(WAIT).await.unwrap().unwrap();

        assert_ne!(fetched.task_id, task.id);
        assert_eq!(fetched.payload, TaskPayload::upscale(7, 1));
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn complete_without_lease_is_rejected() {
        let h = harness(UpscaleCheck::Needed, FakePlan::NoChange);
        let err = h
            .coordinator
            .complete(TaskId::from_ulid(ulid::Ulid::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TankobonError::LeaseNotFound(_)));
    }

    #[tokio::test]
    async fn remote_fail_drops_lease_and_counts_retry() {
        let h = harness(UpscaleCheck::Needed, FakePlan::NoChange);
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();
        h.coordinator.fetch(WAIT).await.unwrap().unwrap();

        h.coordinator.fail(task.id, "out of vram").await.unwrap();

        let record = h.queue.get(task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(!h.coordinator.heartbeat(task.id).await);
    }

    #[tokio::test]
    async fn cancel_drops_lease_and_repair_files() {
        let h = harness(UpscaleCheck::Needed, FakePlan::Repairable(2));
        let task = h.queue.enqueue(TaskPayload::repair(7, 1)).await.unwrap();
        let assignment = h.coordinator.fetch(WAIT).await.unwrap().unwrap().repair.unwrap();

        assert!(h.coordinator.cancel(task.id).await.unwrap());

        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Canceled);
        assert!(!assignment.bundle_path.exists());
        assert!(!h.coordinator.cancel(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn dropped_fetch_still_leases_and_reaper_recovers() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let queue = queue_with(clock.clone() as Arc<dyn Clock>);
        let inspector = FakeInspector::slow(UpscaleCheck::Needed, Duration::from_millis(200));
        let h = harness_on(clock, queue, inspector, FakePlan::NoChange);
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();

        // the caller goes away while the inspector is still running
        let fetch = h.coordinator.fetch(Duration::from_secs(5));
        let dropped = tokio::time::timeout(Duration::from_millis(20), fetch).await;
        assert!(dropped.is_err());

        for _ in 0..100 {
            if h.coordinator.leased().await == vec![task.id] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.coordinator.leased().await, vec![task.id]);

        h.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(h.coordinator.reap_dead_leases().await, vec![task.id]);
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Pending);

        let again = h.coordinator.fetch(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(again.task_id, task.id);
    }

    #[tokio::test]
    async fn store_error_during_reap_keeps_lease_for_next_pass() {
        let (h, store) = flaky_harness();
        let a = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();
        let b = h.queue.enqueue(TaskPayload::upscale(8, 1)).await.unwrap();
        h.coordinator.fetch(WAIT).await.unwrap().unwrap();
        h.coordinator.fetch(WAIT).await.unwrap().unwrap();
        h.clock.advance(chrono::Duration::minutes(2));

        store.fail_gets(1);
        let first = h.coordinator.reap_dead_leases().await;
        assert_eq!(first.len(), 1);
        assert_eq!(h.coordinator.leased().await.len(), 1);

        let second = h.coordinator.reap_dead_leases().await;
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);

        assert_eq!(status(&h.queue, a.id).await, TaskStatus::Pending);
        assert_eq!(status(&h.queue, b.id).await, TaskStatus::Pending);
        assert_eq!(h.queue.delivery().len(Lane::Upscale).await, 2);
        assert!(h.coordinator.leased().await.is_empty());
    }

    #[tokio::test]
    async fn unreadable_record_is_pushed_back_on_fetch() {
        let (h, store) = flaky_harness();
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();

        store.fail_gets(1);
        assert!(h.coordinator.fetch(WAIT).await.is_err());
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Pending);
        assert_eq!(h.queue.delivery().len(Lane::Upscale).await, 1);

        let fetched = h.coordinator.fetch(WAIT).await.unwrap().unwrap();
        assert_eq!(fetched.task_id, task.id);
    }

    #[tokio::test]
    async fn unrecorded_prepare_failure_is_left_to_reaper() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = Arc::new(FlakyStore::default());
        let queue = queue_on(store.clone(), clock.clone() as Arc<dyn Clock>);
        let h = harness_on(
            clock,
            queue,
            FakeInspector::new(UpscaleCheck::SourceMissing),
            FakePlan::NoChange,
        );
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();

        store.refuse_writes(TaskStatus::Failed, 2);
        assert!(h.coordinator.fetch(WAIT).await.unwrap().is_none());
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Processing);
        assert_eq!(h.coordinator.leased().await, vec![task.id]);

        assert_eq!(h.coordinator.reap_dead_leases().await, vec![task.id]);
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Pending);
        assert_eq!(h.queue.delivery().len(Lane::Upscale).await, 1);
    }

    #[tokio::test]
    async fn failed_completion_write_keeps_lease() {
        let (h, store) = flaky_harness();
        let task = h.queue.enqueue(TaskPayload::upscale(7, 1)).await.unwrap();
        h.coordinator.fetch(WAIT).await.unwrap().unwrap();

        store.refuse_writes(TaskStatus::Completed, 1);
        assert!(h.coordinator.complete(task.id).await.is_err());
        assert!(h.coordinator.heartbeat(task.id).await);

        h.coordinator.complete(task.id).await.unwrap();
        assert_eq!(status(&h.queue, task.id).await, TaskStatus::Completed);
        assert!(h.coordinator.leased().await.is_empty());
    }

    #[tokio::test]
    async fn fetch_wait_is_capped() {
        let h = harness(UpscaleCheck::Needed, FakePlan::NoChange);
        let coordinator = Arc::new(
            DistributedCoordinator::new(
                h.queue.clone(),
                Arc::new(FakeInspector::new(UpscaleCheck::Needed)),
                RepairDelegator::new(h.analyzer.clone(), h._work.path()),
                h.chapters.clone(),
                h.queue.notifier().clone(),
            )
            .with_fetch_wait(Duration::from_millis(30)),
        );

        let started = Instant::now();
        assert!(coordinator.fetch(Duration::from_secs(60)).await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
