use crate::queue::priority::MutationPriority;
use crate::queue::retry_policy::FailureReason;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 变更 ID（客户端生成，全局唯一）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(pub String);

impl MutationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MutationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MutationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 变更操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    BulkUpdate,
    BulkDelete,
}

impl MutationKind {
    /// 该操作是否删除实体
    pub fn is_delete(&self) -> bool {
        matches!(self, MutationKind::Delete | MutationKind::BulkDelete)
    }

    pub fn name(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
            MutationKind::BulkUpdate => "bulk_update",
            MutationKind::BulkDelete => "bulk_delete",
        }
    }
}

/// 变更状态
///
/// 合法迁移：
/// - Pending → InProgress → Completed
/// - Pending → InProgress → Pending（可重试失败，带 not_before）
/// - Pending → InProgress → Failed（重试耗尽或服务端拒绝）
/// - Pending → InProgress → Conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationStatus {
    /// 等待处理
    Pending,
    /// 正在处理
    InProgress,
    /// 处理完成
    Completed,
    /// 终态失败，不会自动重试
    Failed,
    /// 与远端版本冲突，等待解决
    Conflict,
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationStatus::Pending => write!(f, "pending"),
            MutationStatus::InProgress => write!(f, "in_progress"),
            MutationStatus::Completed => write!(f, "completed"),
            MutationStatus::Failed => write!(f, "failed"),
            MutationStatus::Conflict => write!(f, "conflict"),
        }
    }
}

/// 实体键，同一实体的变更严格按创建顺序应用
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

/// 队列中的一条待同步变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: MutationId,
    pub kind: MutationKind,
    pub entity_type: String,
    /// Create 在服务端分配 ID 前为空
    pub entity_id: Option<String>,
    pub payload: Value,
    /// 变更开始时的实体快照（共同祖先）
    pub previous_payload: Option<Value>,
    /// 本地变更基于的远端版本号
    pub base_version: Option<u64>,
    pub status: MutationStatus,
    /// 创建时间（UTC 毫秒），0 表示入队时由队列时钟填写
    pub created_at: i64,
    /// 入队序号，同一毫秒内保持先后顺序
    #[serde(default)]
    pub sequence: u64,
    pub last_attempt_at: Option<i64>,
    /// 退避期间不得早于此时间出队
    pub not_before: Option<i64>,
    pub retry_count: u32,
    /// 入队时由队列配置补齐
    pub max_retries: Option<u32>,
    /// 数值越大越先处理
    pub priority: i32,
    /// 必须先完成的变更
    pub depends_on: Vec<MutationId>,
    /// UI 已经乐观地展示了该变更
    pub optimistic: bool,
    pub user_id: String,
    pub error_message: Option<String>,
    pub last_failure_reason: Option<FailureReason>,
}

impl QueuedMutation {
    /// 创建新的待同步变更
    pub fn new(
        kind: MutationKind,
        entity_type: impl Into<String>,
        entity_id: Option<String>,
        payload: Value,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: MutationId::new(),
            kind,
            entity_type: entity_type.into(),
            entity_id,
            payload,
            previous_payload: None,
            base_version: None,
            status: MutationStatus::Pending,
            created_at: 0,
            sequence: 0,
            last_attempt_at: None,
            not_before: None,
            retry_count: 0,
            max_retries: None,
            priority: MutationPriority::from_kind(kind).value(),
            depends_on: Vec::new(),
            optimistic: false,
            user_id: user_id.into(),
            error_message: None,
            last_failure_reason: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<MutationId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_previous(mut self, previous: Value, base_version: u64) -> Self {
        self.previous_payload = Some(previous);
        self.base_version = Some(base_version);
        self
    }

    pub fn with_priority(mut self, priority: MutationPriority) -> Self {
        self.priority = priority.value();
        self
    }

    pub fn with_dependency(mut self, id: MutationId) -> Self {
        self.depends_on.push(id);
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn optimistic(mut self) -> Self {
        self.optimistic = true;
        self
    }

    /// 实体键；Create 尚无 entity_id 时以变更 ID 代替
    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type.clone(),
            entity_id: self
                .entity_id
                .clone()
                .unwrap_or_else(|| self.id.0.clone()),
        }
    }

    /// 本地变更之后实体的快照，删除时为 None
    pub fn local_snapshot(&self) -> Option<Value> {
        if self.kind.is_delete() {
            None
        } else {
            Some(self.payload.clone())
        }
    }

    /// 队列内排序键：创建时间 + 入队序号
    pub fn order_key(&self) -> (i64, u64) {
        (self.created_at, self.sequence)
    }

    /// 当前是否可以出队（不含依赖检查）
    pub fn is_ready(&self, now_ms: i64) -> bool {
        self.status == MutationStatus::Pending
            && self.not_before.map_or(true, |not_before| now_ms >= not_before)
    }

    pub fn effective_max_retries(&self, default_max: u32) -> u32 {
        self.max_retries.unwrap_or(default_max)
    }

    pub(crate) fn mark_in_progress(&mut self, now_ms: i64) {
        self.status = MutationStatus::InProgress;
        self.last_attempt_at = Some(now_ms);
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = MutationStatus::Completed;
        self.not_before = None;
        self.error_message = None;
        self.last_failure_reason = None;
    }

    pub(crate) fn mark_failed(&mut self, error: String, reason: Option<FailureReason>) {
        self.status = MutationStatus::Failed;
        self.not_before = None;
        self.error_message = Some(error);
        self.last_failure_reason = reason;
    }

    pub(crate) fn schedule_retry(&mut self, not_before: i64, error: String, reason: FailureReason) {
        self.status = MutationStatus::Pending;
        self.not_before = Some(not_before);
        self.error_message = Some(error);
        self.last_failure_reason = Some(reason);
    }

    pub(crate) fn mark_conflict(&mut self, conflict_id: &str) {
        self.status = MutationStatus::Conflict;
        self.not_before = None;
        self.error_message = Some(format!("conflict {}", conflict_id));
    }

    pub(crate) fn release(&mut self) {
        self.status = MutationStatus::Pending;
    }
}
