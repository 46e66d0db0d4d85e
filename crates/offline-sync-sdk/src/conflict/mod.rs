//! 冲突检测与解决
//!
//! 本模块提供：
//! - [`ConflictDetector`]：对比 base/local/remote 三方快照，生成字段级差异
//! - [`ResolutionEngine`]：按策略解决冲突、写审计日志、重新入队解决后的变更
//! - [`ConflictLog`]：只追加的冲突解决历史

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::queue::MutationId;

pub mod detector;
pub mod log;
pub mod resolver;

pub use detector::{ConflictDetector, ConflictSides, FieldComparator};
pub use log::ConflictLog;
pub use resolver::{
    CustomResolver, FieldMergeRule, ManualChoice, Resolution, ResolutionAction, ResolutionConfig,
    ResolutionEngine,
};

/// 冲突 ID
///
/// 由触发冲突的变更 ID 确定性派生，同一变更重放时得到同一个冲突
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(pub String);

impl ConflictId {
    pub fn for_mutation(mutation_id: &MutationId) -> Self {
        let name = format!("conflict:{}", mutation_id);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
    }

    /// 解决后重新入队的变更 ID，崩溃重放时不会重复入队
    pub fn resolved_mutation_id(&self) -> MutationId {
        let name = format!("resolved:{}", self.0);
        MutationId(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConflictId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 一方变更的元数据
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub user_id: String,
    pub display_name: Option<String>,
    /// 变更时间（UTC 毫秒）
    pub timestamp: i64,
    pub device_id: Option<String>,
    /// 乐观并发版本号
    pub version: u64,
}

impl ChangeMetadata {
    pub fn new(user_id: impl Into<String>, timestamp: i64, version: u64) -> Self {
        Self {
            user_id: user_id.into(),
            timestamp,
            version,
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// 冲突类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    /// 双方都修改了实体
    UpdateUpdate,
    /// 本地修改，远端已删除
    UpdateDelete,
    /// 本地删除，远端已修改
    DeleteUpdate,
    /// 双方各自创建了 ID 相同的实体，没有共同祖先
    CreateCreate,
}

impl ConflictType {
    pub fn name(&self) -> &'static str {
        match self {
            ConflictType::UpdateUpdate => "update_update",
            ConflictType::UpdateDelete => "update_delete",
            ConflictType::DeleteUpdate => "delete_update",
            ConflictType::CreateCreate => "create_create",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 解决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// 时间戳较新的一方整体胜出
    LastWriteWins,
    /// 字段级合并，无法自动合并的字段升级为人工处理
    FieldMerge,
    /// 等待用户选择
    Manual,
    /// 调用应用注入的钩子
    Custom,
}

/// 单个字段的差异
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    /// None 表示该侧不存在此字段
    pub base: Option<Value>,
    pub local: Option<Value>,
    pub remote: Option<Value>,
    pub local_changed: bool,
    pub remote_changed: bool,
    /// 双方都偏离 base 且彼此不同
    pub has_conflict: bool,
    /// 合并后该字段的值；`Some(None)` 表示合并结果删除该字段
    pub resolved: Option<Option<Value>>,
}

/// 一次检测到的冲突
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub conflict_type: ConflictType,
    /// 触发冲突的本地变更
    pub mutation_id: MutationId,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub base: Option<Value>,
    pub local: Option<Value>,
    pub remote: Option<Value>,
    pub local_metadata: ChangeMetadata,
    pub remote_metadata: ChangeMetadata,
    pub field_changes: Vec<FieldChange>,
    pub detected_at: i64,
    /// 由解决引擎选定
    pub strategy: Option<ResolutionStrategy>,
    pub resolved: bool,
    pub resolved_snapshot: Option<Value>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<i64>,
}

impl Conflict {
    /// 真正冲突的字段名
    pub fn conflicting_fields(&self) -> Vec<&str> {
        self.field_changes
            .iter()
            .filter(|change| change.has_conflict)
            .map(|change| change.field.as_str())
            .collect()
    }
}

/// 冲突解决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    LocalAccepted,
    RemoteAccepted,
    Merged,
    Custom,
    Skipped,
}

impl ResolutionOutcome {
    /// 远端已经是最终状态，无需重新入队
    pub fn keeps_remote(&self) -> bool {
        matches!(self, ResolutionOutcome::RemoteAccepted | ResolutionOutcome::Skipped)
    }
}

/// 冲突解决审计记录，每个冲突只写一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    /// 与冲突 ID 相同
    pub id: String,
    pub conflict_id: ConflictId,
    pub mutation_id: MutationId,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub conflict_type: ConflictType,
    pub strategy: ResolutionStrategy,
    pub outcome: ResolutionOutcome,
    pub resolved_by: String,
    pub resolved_at: i64,
    pub automatic: bool,
    pub local: Option<Value>,
    pub remote: Option<Value>,
    pub resolved: Option<Value>,
}
