//! tankobon-core
//!
//! マンガのアップスケール処理のための永続タスクキューと、
//! remote worker との協調プロトコル。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status, payload, progress, record, events, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, DeliveryQueue, Clock, ChapterInspector, RepairAnalyzer）
//! - **impls**: 実装（InMemoryTaskStore, FileTaskStore, InMemoryDeliveryQueue）
//! - **app**: アプリケーションロジック（queue, persistence, worker_loop, coordinator, builder）
//! - **config**: 運用パラメータ

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use crate::app::{App, AppBuilder, TaskContext, TaskHandler};
pub use crate::config::{ExecutionMode, QueueConfig};
pub use crate::domain::{Result, TankobonError, TaskId, TaskKind, TaskPayload, TaskStatus};
