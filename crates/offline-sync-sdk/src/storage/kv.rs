//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 用户隔离的命名空间（每个用户一个 Tree）
//! - 打开数据库时的锁冲突重试

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sled::{Db, Tree};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Result, SyncError};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    base_path: PathBuf,
    /// 主数据库实例
    db: Arc<Db>,
    /// 用户专属的 Tree 实例
    user_trees: Arc<RwLock<HashMap<String, Tree>>>,
}

impl KvStore {
    /// 打开 `<base_path>/kv` 下的 sled 数据库
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path).await?;

        // 上一个进程实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    return Ok(Self {
                        base_path,
                        db: Arc::new(db),
                        user_trees: Arc::new(RwLock::new(HashMap::new())),
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    last_err = Some(e);
                    if !is_lock || attempt + 1 == MAX_OPEN_RETRIES {
                        break;
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                    warn!("sled 数据库被占用，{}ms 后重试 (attempt {})", delay_ms, attempt + 1);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }

        Err(last_err
            .map(SyncError::from)
            .unwrap_or_else(|| SyncError::Storage("打开 sled 数据库失败".to_string())))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 获取（必要时创建）用户 Tree
    pub async fn user_tree(&self, uid: &str) -> Result<Tree> {
        if let Some(tree) = self.user_trees.read().await.get(uid) {
            return Ok(tree.clone());
        }

        let tree = self.db.open_tree(Self::tree_name(uid))?;
        self.user_trees
            .write()
            .await
            .insert(uid.to_string(), tree.clone());

        info!("用户 KV Tree 初始化完成: {}", uid);
        Ok(tree)
    }

    /// 把所有脏数据刷到磁盘
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn tree_name(uid: &str) -> String {
        format!("user_{}", uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_user_trees_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        let alice = store.user_tree("alice").await.unwrap();
        let bob = store.user_tree("bob").await.unwrap();

        alice.insert("k", b"a".to_vec()).unwrap();
        assert!(bob.get("k").unwrap().is_none());
        assert_eq!(alice.get("k").unwrap().unwrap().as_ref(), b"a");

        // 同一用户再次获取得到同一个 Tree
        let again = store.user_tree("alice").await.unwrap();
        assert_eq!(again.get("k").unwrap().unwrap().as_ref(), b"a");
    }
}
