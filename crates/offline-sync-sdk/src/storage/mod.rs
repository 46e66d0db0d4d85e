//! 持久化存储层
//!
//! 本模块提供：
//! - [`QueueStore`] 持久化契约：按 ID 读写变更、冲突、冲突日志和处理锁
//! - [`SledQueueStore`] 基于 sled 的实现，每次写入后 flush，进程重启后可恢复
//! - [`MemoryQueueStore`] 内存实现，用于测试和无需持久化的宿主

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::conflict::{Conflict, ConflictId, ConflictLogEntry};
use crate::error::Result;
use crate::queue::{MutationId, QueuedMutation};

pub mod kv;
pub mod memory;
pub mod sled_store;

pub use kv::KvStore;
pub use memory::MemoryQueueStore;
pub use sled_store::SledQueueStore;

/// 持久化的处理锁（drain 互斥标记）
///
/// 崩溃后残留的锁在超过陈旧窗口后被清除
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingLock {
    /// 持有者标识（每个 drain 周期一个）
    pub owner: String,
    /// 获取时间（UTC 毫秒）
    pub acquired_at: i64,
}

impl ProcessingLock {
    pub fn is_stale(&self, now_ms: i64, staleness_window_ms: u64) -> bool {
        let window = i64::try_from(staleness_window_ms).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.acquired_at) >= window
    }
}

/// 存储记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", content = "data")]
pub enum StoreRecord {
    Mutation(QueuedMutation),
    Conflict(Conflict),
    LogEntry(ConflictLogEntry),
    ProcessingLock(ProcessingLock),
}

impl StoreRecord {
    pub fn key(&self) -> RecordKey {
        match self {
            StoreRecord::Mutation(mutation) => RecordKey::Mutation(mutation.id.clone()),
            StoreRecord::Conflict(conflict) => RecordKey::Conflict(conflict.id.clone()),
            StoreRecord::LogEntry(entry) => RecordKey::LogEntry(entry.id.clone()),
            StoreRecord::ProcessingLock(_) => RecordKey::ProcessingLock,
        }
    }
}

/// 存储键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Mutation(MutationId),
    Conflict(ConflictId),
    LogEntry(String),
    ProcessingLock,
}

impl RecordKey {
    /// 存储层使用的字符串键
    pub fn storage_key(&self) -> String {
        match self {
            RecordKey::Mutation(id) => format!("{}{}", keys::MUTATION, id),
            RecordKey::Conflict(id) => format!("{}{}", keys::CONFLICT, id),
            RecordKey::LogEntry(id) => format!("{}{}", keys::CONFLICT_LOG, id),
            RecordKey::ProcessingLock => keys::PROCESSING_LOCK.to_string(),
        }
    }
}

/// 存储键前缀
pub mod keys {
    /// 队列命名空间前缀
    pub const NAMESPACE: &str = "offline_queue:";
    pub const MUTATION: &str = "offline_queue:mutation:";
    pub const CONFLICT: &str = "offline_queue:conflict:";
    pub const CONFLICT_LOG: &str = "offline_queue:conflict_log:";
    pub const PROCESSING_LOCK: &str = "offline_queue:processing_lock";
}

/// 持久化契约
///
/// 每次调用必须是原子的，并在进程重启后保留
#[async_trait]
pub trait QueueStore: Send + Sync + Debug {
    async fn get(&self, key: &RecordKey) -> Result<Option<StoreRecord>>;

    /// 插入或覆盖
    async fn put(&self, record: &StoreRecord) -> Result<()>;

    async fn delete(&self, key: &RecordKey) -> Result<()>;

    async fn list_all(&self) -> Result<Vec<StoreRecord>>;
}
