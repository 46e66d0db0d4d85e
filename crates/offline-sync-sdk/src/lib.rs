//! Offline Sync SDK - 离线变更队列与冲突解决引擎
//!
//! 本 SDK 让应用在离线时照常写入，联网后可靠地把本地变更同步到远端：
//! - 📥 持久化变更队列：幂等入队、优先级、依赖、指数退避重试
//! - 🔋 设备条件门控：网络、电量、存储、省流量和静默时段
//! - ⚔️ 冲突检测：逐字段三方比较，区分更新/删除/创建冲突
//! - 🧩 冲突解决：字段合并规则、LastWriteWins、自定义钩子和手动解决
//! - 🔄 同步协调：单周期互斥、同实体顺序、跨实体并发、可取消
//! - 📡 状态发布：watch 快照和广播事件
//!
//! # 快速开始
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use offline_sync_sdk::{EngineCollaborators, OfflineSyncConfig, OfflineSyncEngine};
//! use offline_sync_sdk::queue::{MutationKind, QueuedMutation};
//!
//! #[tokio::main]
//! async fn main() -> offline_sync_sdk::Result<()> {
//!     let config = OfflineSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .user_id("user123")
//!         .clock_skew_tolerance_ms(2_000)
//!         .build()?;
//!
//!     // remote 实现 RemoteApply，probe 实现 DeviceProbe
//!     let engine = OfflineSyncEngine::open(config, EngineCollaborators::new(remote, probe)).await?;
//!     engine.start_scheduler().await?;
//!
//!     engine
//!         .enqueue(QueuedMutation::new(
//!             MutationKind::Update,
//!             "item",
//!             Some("item-1".to_string()),
//!             serde_json::json!({"quantity": 2}),
//!             "user123",
//!         ))
//!         .await?;
//!
//!     let report = engine.sync_now().await;
//!     println!("同步结果: {:?}", report.outcome);
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conflict;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod network;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use config::{EventConfig, OfflineSyncConfig, OfflineSyncConfigBuilder};
pub use conflict::{
    ChangeMetadata, Conflict, ConflictId, ConflictType, CustomResolver, FieldMergeRule,
    ManualChoice, Resolution, ResolutionAction, ResolutionConfig, ResolutionStrategy,
};
pub use device::{BatteryInfo, DeviceProbe, GateConfig, NetworkInfo, SkipReason, StorageInfo};
pub use engine::{EngineCollaborators, OfflineSyncEngine};
pub use error::{Result, SyncError};
pub use events::{EventManager, SyncEvent};
pub use network::{NetworkMonitor, NetworkStatusEvent, NetworkStatusListener};
pub use queue::{
    MutationId, MutationKind, MutationPriority, MutationStatus, QueueConfig, QueueStats,
    QueuedMutation, RetryPolicy,
};
pub use storage::{MemoryQueueStore, QueueStore, SledQueueStore};
pub use sync::{
    ApplyOutcome, AuthRefresher, ConnectionStatus, CoordinatorConfig, CycleOutcome, CycleReport,
    RemoteApply, RemoteError, SchedulerConfig, SyncState, SyncStatus, SyncTrigger,
};
pub use utils::{Clock, SystemClock, TimezoneConfig};
