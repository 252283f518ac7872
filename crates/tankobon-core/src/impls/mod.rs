//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryDeliveryQueue**: レーン
//! - **InMemoryTaskStore**: 開発・テスト用の正本
//! - **FileTaskStore**: JSON スナップショットによる永続化

pub mod file_store;
pub mod inmem_delivery;
pub mod memory_store;

pub use self::file_store::FileTaskStore;
pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::memory_store::InMemoryTaskStore;
