use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::conflict::{ConflictId, ConflictLogEntry};
use crate::error::{Result, SyncError};
use crate::storage::{QueueStore, RecordKey, StoreRecord};

/// 只追加的冲突解决日志
///
/// 每个冲突至多一条记录，写入后不可修改
#[derive(Debug)]
pub struct ConflictLog {
    store: Arc<dyn QueueStore>,
    entries: RwLock<Vec<ConflictLogEntry>>,
}

impl ConflictLog {
    /// 从存储加载已有日志
    pub async fn open(store: Arc<dyn QueueStore>) -> Result<Self> {
        let mut entries: Vec<ConflictLogEntry> = store
            .list_all()
            .await?
            .into_iter()
            .filter_map(|record| match record {
                StoreRecord::LogEntry(entry) => Some(entry),
                _ => None,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.resolved_at
                .cmp(&b.resolved_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(Self {
            store,
            entries: RwLock::new(entries),
        })
    }

    /// 追加一条记录，同一冲突重复写入返回 AlreadyExists
    pub async fn append(&self, entry: ConflictLogEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|existing| existing.conflict_id == entry.conflict_id) {
            return Err(SyncError::AlreadyExists(format!(
                "conflict log entry for {}",
                entry.conflict_id
            )));
        }

        self.store.put(&StoreRecord::LogEntry(entry.clone())).await?;
        info!(
            "冲突日志已写入: conflict={}, outcome={:?}, automatic={}",
            entry.conflict_id, entry.outcome, entry.automatic
        );
        entries.push(entry);
        Ok(())
    }

    pub async fn find(&self, conflict_id: &ConflictId) -> Option<ConflictLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|entry| &entry.conflict_id == conflict_id)
            .cloned()
    }

    /// 全部记录，按解决时间排序
    pub async fn entries(&self) -> Vec<ConflictLogEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 直接从存储读取一条记录
    pub async fn load(&self, conflict_id: &ConflictId) -> Result<Option<ConflictLogEntry>> {
        match self
            .store
            .get(&RecordKey::LogEntry(conflict_id.to_string()))
            .await?
        {
            Some(StoreRecord::LogEntry(entry)) => Ok(Some(entry)),
            _ => Ok(None),
        }
    }
}
