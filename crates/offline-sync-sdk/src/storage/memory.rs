use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::storage::{QueueStore, RecordKey, StoreRecord};

/// 基于内存的队列存储实现
#[derive(Debug, Default, Clone)]
pub struct MemoryQueueStore {
    records: Arc<RwLock<BTreeMap<String, StoreRecord>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<StoreRecord>> {
        Ok(self.records.read().await.get(&key.storage_key()).cloned())
    }

    async fn put(&self, record: &StoreRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.key().storage_key(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        self.records.write().await.remove(&key.storage_key());
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<StoreRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
