//! 远端应用契约
//!
//! 远端权威服务必须保证：同一个变更 ID 应用两次不产生重复效果。
//! 队列是至少一次投递，崩溃恢复后可能重放已经成功的变更。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::conflict::ChangeMetadata;
use crate::queue::QueuedMutation;

/// 远端应用错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    /// 4xx 校验失败为终态；5xx 按网络错误重试
    #[error("server rejected mutation ({status}): {message}")]
    ServerRejection { status: u16, message: String },

    #[error("authentication expired")]
    AuthExpired,

    #[error("remote quota exceeded")]
    QuotaExceeded,

    #[error("request timed out")]
    Timeout,
}

/// 远端应用结果
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// 已应用，返回实体的新版本号
    Applied { new_version: Option<u64> },
    /// 版本不匹配，附带远端当前快照（None 表示已删除）和元数据
    Conflict {
        remote_snapshot: Option<Value>,
        remote_metadata: ChangeMetadata,
    },
}

/// 远端应用协作者
#[async_trait]
pub trait RemoteApply: Send + Sync {
    async fn apply(&self, mutation: &QueuedMutation) -> Result<ApplyOutcome, RemoteError>;
}

/// 认证刷新协作者
///
/// 远端返回 AuthExpired 时，协调器暂停 drain 并请求刷新
#[async_trait]
pub trait AuthRefresher: Send + Sync {
    async fn refresh(&self) -> Result<(), RemoteError>;
}

/// 不支持刷新的默认实现，AuthExpired 直接按失败处理
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthRefresh;

#[async_trait]
impl AuthRefresher for NoAuthRefresh {
    async fn refresh(&self) -> Result<(), RemoteError> {
        Err(RemoteError::AuthExpired)
    }
}
