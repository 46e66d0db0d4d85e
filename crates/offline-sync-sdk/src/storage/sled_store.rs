use async_trait::async_trait;
use sled::Tree;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::{keys, KvStore, QueueStore, RecordKey, StoreRecord};

/// 基于 sled 用户 Tree 的持久化队列存储
///
/// 每次写入后 flush，保证调用返回时数据已落盘
#[derive(Debug, Clone)]
pub struct SledQueueStore {
    tree: Tree,
}

impl SledQueueStore {
    /// 打开指定用户的队列存储
    pub async fn open(kv_store: &KvStore, uid: &str) -> Result<Self> {
        let tree = kv_store.user_tree(uid).await?;
        Ok(Self { tree })
    }
}

#[async_trait]
impl QueueStore for SledQueueStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<StoreRecord>> {
        match self.tree.get(key.storage_key())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &StoreRecord) -> Result<()> {
        let key = record.key().storage_key();
        let bytes = serde_json::to_vec(record)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        self.tree.flush_async().await?;
        debug!("持久化记录: {}", key);
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        self.tree.remove(key.storage_key())?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<StoreRecord>> {
        let mut records = Vec::new();
        for item in self.tree.scan_prefix(keys::NAMESPACE) {
            let (key, bytes) = item?;
            match serde_json::from_slice::<StoreRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // 损坏的记录跳过，不阻塞整个队列恢复
                    warn!(
                        "跳过无法解析的记录 {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                }
            }
        }
        Ok(records)
    }
}
