//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - ローカルループに届き得る種別にハンドラが無ければ `build()` で失敗する
//!   - standard レーンの種別すべて
//!   - local-only な upscale 種別すべて
//!   - local モードでは upscale レーンの種別すべて
//! - distributed モードでは ChapterInspector と RepairAnalyzer が必須
//!
//! # 使用例
//! ```ignore
//! let mut app = AppBuilder::new(config)
//!     .register(TaskKind::LibraryScan, ScanHandler)?
//!     .store(store)
//!     .build()?;
//! app.start().await?;
//! app.queue().enqueue(TaskPayload::upscale(7, 1)).await?;
//! app.shutdown().await;
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ExecutionMode, QueueConfig};
use crate::domain::{Lane, Result, StoreError, TaskEvent, TaskId, TaskKind};
use crate::impls::{FileTaskStore, InMemoryDeliveryQueue, InMemoryTaskStore};
use crate::ports::{
    ChapterChangedNotifier, ChapterInspector, Clock, DeliveryQueue, NoopChapterNotifier,
    RepairAnalyzer, SystemClock, TaskStore, UlidGenerator,
};

use super::coordinator::DistributedCoordinator;
use super::gc_loop::{GcLoop, QueueCleanup};
use super::persistence::TaskPersistence;
use super::queue::TaskQueue;
use super::reaper_loop::ReaperLoop;
use super::repair::RepairDelegator;
use super::runtime::{HandlerRegistry, TaskHandler};
use super::status::StatusNotifier;
use super::worker_loop::LocalProcessor;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no handler registered for kinds {0:?}; these can reach a local processor")]
    MissingHandlers(Vec<TaskKind>),

    #[error("duplicate handler for kind={0}")]
    DuplicateHandler(TaskKind),

    #[error("distributed mode requires a {0}")]
    MissingCollaborator(&'static str),
}

/// Open the store named by `config.store_path`, or an in-memory one.
pub async fn open_store(config: &QueueConfig) -> Result<Arc<dyn TaskStore>, StoreError> {
    Ok(match &config.store_path {
        Some(path) => Arc::new(FileTaskStore::open(path).await?),
        None => Arc::new(InMemoryTaskStore::new()),
    })
}

pub struct AppBuilder {
    config: QueueConfig,
    registry: HandlerRegistry,
    store: Option<Arc<dyn TaskStore>>,
    delivery: Option<Arc<dyn DeliveryQueue>>,
    clock: Option<Arc<dyn Clock>>,
    inspector: Option<Arc<dyn ChapterInspector>>,
    analyzer: Option<Arc<dyn RepairAnalyzer>>,
    chapters: Option<Arc<dyn ChapterChangedNotifier>>,
    notifier: Option<StatusNotifier>,
}

impl AppBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            store: None,
            delivery: None,
            clock: None,
            inspector: None,
            analyzer: None,
            chapters: None,
            notifier: None,
        }
    }

    pub fn register(
        mut self,
        kind: TaskKind,
        handler: impl TaskHandler + 'static,
    ) -> Result<Self, BuildError> {
        self.registry
            .register(kind, Arc::new(handler))
            .map_err(|_| BuildError::DuplicateHandler(kind))?;
        Ok(self)
    }

    /// Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn delivery(mut self, delivery: Arc<dyn DeliveryQueue>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn inspector(mut self, inspector: Arc<dyn ChapterInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn repair_analyzer(mut self, analyzer: Arc<dyn RepairAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn chapter_notifier(mut self, chapters: Arc<dyn ChapterChangedNotifier>) -> Self {
        self.chapters = Some(chapters);
        self
    }

    pub fn notifier(mut self, notifier: StatusNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Kinds that some local processor may have to execute.
    fn locally_executed(&self) -> Vec<TaskKind> {
        let distributed = self.config.execution_mode == ExecutionMode::Distributed;
        TaskKind::ALL
            .into_iter()
            .filter(|kind| match kind.lane() {
                Lane::Upscale => !distributed || kind.is_local_only(),
                Lane::Standard | Lane::Rerouted => true,
            })
            .collect()
    }

    pub fn build(self) -> Result<App, BuildError> {
        let missing: Vec<TaskKind> = self
            .locally_executed()
            .into_iter()
            .filter(|kind| !self.registry.contains(*kind))
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingHandlers(missing));
        }

        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let delivery = self
            .delivery
            .unwrap_or_else(|| Arc::new(InMemoryDeliveryQueue::new()));
        let notifier = self.notifier.unwrap_or_default();

        let persistence = Arc::new(TaskPersistence::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            config.claim_attempts,
        ));
        let queue = Arc::new(TaskQueue::new(
            store,
            delivery,
            persistence,
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            notifier.clone(),
        ));

        let coordinator = match config.execution_mode {
            ExecutionMode::Local => None,
            ExecutionMode::Distributed => {
                let inspector = self
                    .inspector
                    .ok_or(BuildError::MissingCollaborator("chapter inspector"))?;
                let analyzer = self
                    .analyzer
                    .ok_or(BuildError::MissingCollaborator("repair analyzer"))?;
                let chapters = self
                    .chapters
                    .unwrap_or_else(|| Arc::new(NoopChapterNotifier));
                let coordinator = DistributedCoordinator::new(
                    queue.clone(),
                    inspector,
                    RepairDelegator::new(analyzer, config.work_dir.clone()),
                    chapters,
                    notifier.clone(),
                )
                .with_lease_timing(config.lease_grace(), config.lease_skew())
                .with_fetch_wait(config.fetch_timeout());
                Some(Arc::new(coordinator))
            }
        };

        let registry = Arc::new(self.registry);
        let processor = |name: &'static str, lanes: Vec<Lane>| {
            Arc::new(
                LocalProcessor::new(name, lanes, queue.clone(), registry.clone(), notifier.clone())
                    .with_poll_interval(config.poll_interval())
                    .with_debounce(config.progress_debounce()),
            )
        };
        let standard = processor("standard", vec![Lane::Standard]);
        // rerouted work is always local; the upscale lane only when not delegated
        let upscale_lanes = match config.execution_mode {
            ExecutionMode::Local => vec![Lane::Rerouted, Lane::Upscale],
            ExecutionMode::Distributed => vec![Lane::Rerouted],
        };
        let upscale = processor("upscale", upscale_lanes);

        Ok(App {
            config,
            queue,
            standard,
            upscale,
            coordinator,
            notifier,
            shutdown: CancellationToken::new(),
            joins: Vec::new(),
        })
    }
}

/// Wired application. `start` spawns the loops, `shutdown` stops them.
pub struct App {
    config: QueueConfig,
    queue: Arc<TaskQueue>,
    standard: Arc<LocalProcessor>,
    upscale: Arc<LocalProcessor>,
    coordinator: Option<Arc<DistributedCoordinator>>,
    notifier: StatusNotifier,
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl App {
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Present only in distributed mode.
    pub fn coordinator(&self) -> Option<&Arc<DistributedCoordinator>> {
        self.coordinator.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.notifier.subscribe()
    }

    pub fn cleanup(&self) -> QueueCleanup {
        QueueCleanup::new(self.queue.store().clone(), self.config.retention_count)
    }

    /// Recover persisted work, then spawn the processors and background loops.
    pub async fn start(&mut self) -> Result<()> {
        let recovered = self.queue.recover().await?;
        info!(
            mode = ?self.config.execution_mode,
            recovered,
            "starting task queue"
        );

        for processor in [&self.standard, &self.upscale] {
            self.joins
                .push(tokio::spawn(processor.clone().run(self.shutdown.clone())));
        }
        if let Some(coordinator) = &self.coordinator {
            let reaper = ReaperLoop::new(coordinator.clone(), self.config.reap_interval());
            self.joins.push(tokio::spawn(reaper.run(self.shutdown.clone())));
        }
        let gc = GcLoop::new(self.cleanup(), self.config.cleanup_interval());
        self.joins.push(tokio::spawn(gc.run(self.shutdown.clone())));
        Ok(())
    }

    /// Cancel `id` wherever it is running. Returns false if nothing held it.
    pub async fn cancel(&self, id: TaskId) -> Result<bool> {
        if self.standard.cancel(id).await || self.upscale.cancel(id).await {
            return Ok(true);
        }
        match &self.coordinator {
            Some(coordinator) => coordinator.cancel(id).await,
            None => Ok(false),
        }
    }

    /// Stop every loop and wait for them. Running local tasks go back to Pending.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for join in self.joins {
            let _ = join.await;
        }
        info!("task queue stopped");
    }
}
