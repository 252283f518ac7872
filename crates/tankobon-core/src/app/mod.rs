//! App - アプリケーション層
//!
//! ports を組み合わせてキューとワーカー協調のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **TaskQueue**: 投入・削除・再投入とレーンのルーティング
//! - **TaskPersistence**: claim / complete / fail / cancel の状態遷移
//! - **LocalProcessor**: レーンごとの単一コンシューマループ
//! - **DistributedCoordinator**: remote worker 向けの fetch / heartbeat / lease
//! - **ReaperLoop**: 期限切れ lease の回収
//! - **GcLoop**: 完了レコードの保持数管理
//! - **AppBuilder**: 構築とワイヤリング

pub mod builder;
pub mod coordinator;
pub mod gc_loop;
pub mod persistence;
pub mod queue;
pub mod reaper_loop;
pub mod repair;
pub mod runtime;
pub mod status;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError, open_store};
pub use self::coordinator::{DistributedCoordinator, FetchedTask, RepairAssignment};
pub use self::gc_loop::{GcLoop, QueueCleanup};
pub use self::persistence::TaskPersistence;
pub use self::queue::TaskQueue;
pub use self::reaper_loop::ReaperLoop;
pub use self::repair::{RepairDelegator, RepairOutcome, RepairState};
pub use self::runtime::{HandlerRegistry, TaskContext, TaskHandler};
pub use self::status::StatusNotifier;
pub use self::worker_loop::LocalProcessor;
