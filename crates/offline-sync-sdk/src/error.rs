use thiserror::Error;

use crate::sync::remote::RemoteError;

/// 离线同步 SDK 错误类型
#[derive(Debug, Error)]
pub enum SyncError {
    /// 持久化存储错误（sled）
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    /// 队列已满且没有可淘汰的 Completed/Failed 记录
    #[error("Queue is full: {size}/{capacity}")]
    QueueFull { size: usize, capacity: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 状态机非法迁移
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    Config(String),

    /// Custom 策略钩子拒绝了冲突解决，冲突保持未解决
    #[error("Resolution rejected: {0}")]
    ResolutionRejected(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Auth refresh failed: {0}")]
    AuthRefreshFailed(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::Io(error.to_string())
    }
}

impl SyncError {
    /// 是否是队列容量错误
    pub fn is_queue_full(&self) -> bool {
        matches!(self, SyncError::QueueFull { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
