//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//!
//! # 設計原則
//! - TaskStore が正本（source of truth）
//! - DeliveryQueue はレーン（task_id のみ）
//! - アーカイブ処理は ChapterInspector / RepairAnalyzer の向こう側

pub mod chapter;
pub mod clock;
pub mod delivery_queue;
pub mod id_generator;
pub mod repair;
pub mod task_store;

pub use self::chapter::{ChapterChangedNotifier, ChapterInspector, NoopChapterNotifier, UpscaleCheck};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery_queue::DeliveryQueue;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::repair::{RepairAnalyzer, RepairBundle, RepairPlan};
pub use self::task_store::TaskStore;
