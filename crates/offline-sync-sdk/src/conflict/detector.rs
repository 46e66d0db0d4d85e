//! 冲突检测
//!
//! 纯函数：只读取三方快照和元数据，不访问存储

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::conflict::{ChangeMetadata, Conflict, ConflictId, ConflictType, FieldChange};
use crate::queue::{MutationKind, QueuedMutation};

/// 字段比较器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldComparator {
    /// 精确相等（默认）
    Exact,
    /// 时间戳字段允许的误差（毫秒），支持毫秒数字和 RFC3339 字符串
    TimestampTolerance(i64),
    /// 数值误差
    NumericEpsilon(f64),
    /// 字符串忽略大小写
    CaseInsensitive,
}

impl Default for FieldComparator {
    fn default() -> Self {
        FieldComparator::Exact
    }
}

impl FieldComparator {
    /// 比较两个字段值；缺失与 null 视为相同
    pub fn equals(&self, a: Option<&Value>, b: Option<&Value>) -> bool {
        let a = a.filter(|v| !v.is_null());
        let b = b.filter(|v| !v.is_null());
        let (a, b) = match (a, b) {
            (None, None) => return true,
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };

        match self {
            FieldComparator::Exact => a == b,
            FieldComparator::TimestampTolerance(tolerance_ms) => {
                match (timestamp_ms(a), timestamp_ms(b)) {
                    (Some(x), Some(y)) => (x - y).abs() <= *tolerance_ms,
                    _ => a == b,
                }
            }
            FieldComparator::NumericEpsilon(epsilon) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => (x - y).abs() <= *epsilon,
                _ => a == b,
            },
            FieldComparator::CaseInsensitive => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.to_lowercase() == y.to_lowercase(),
                _ => a == b,
            },
        }
    }
}

fn timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

/// 检测输入：三方快照和双方元数据
///
/// 快照为 None 表示该侧实体不存在（删除或尚未创建）
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictSides {
    pub base: Option<Value>,
    pub local: Option<Value>,
    pub remote: Option<Value>,
    pub local_metadata: ChangeMetadata,
    pub remote_metadata: ChangeMetadata,
}

impl ConflictSides {
    /// 从本地变更和远端返回的快照构造
    pub fn from_mutation(
        mutation: &QueuedMutation,
        local_metadata: ChangeMetadata,
        remote: Option<Value>,
        remote_metadata: ChangeMetadata,
    ) -> Self {
        Self {
            base: mutation.previous_payload.clone(),
            local: mutation.local_snapshot(),
            remote,
            local_metadata,
            remote_metadata,
        }
    }
}

/// 冲突检测器
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    comparators: HashMap<String, FieldComparator>,
    ignored_fields: HashSet<String>,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_comparator(mut self, field: impl Into<String>, comparator: FieldComparator) -> Self {
        self.comparators.insert(field.into(), comparator);
        self
    }

    /// 不参与比较的字段（如 updated_at）
    pub fn ignore_field(mut self, field: impl Into<String>) -> Self {
        self.ignored_fields.insert(field.into());
        self
    }

    fn comparator(&self, field: &str) -> &FieldComparator {
        static EXACT: FieldComparator = FieldComparator::Exact;
        self.comparators.get(field).unwrap_or(&EXACT)
    }

    /// 检测冲突
    ///
    /// 远端版本等于本地变更的起始版本时没有并发修改，返回 None。
    /// 双方都已删除也不算冲突。
    pub fn detect(
        &self,
        mutation: &QueuedMutation,
        sides: ConflictSides,
        detected_at: i64,
    ) -> Option<Conflict> {
        if let Some(base_version) = mutation.base_version {
            if sides.remote_metadata.version == base_version {
                debug!(
                    "远端版本 {} 与本地基线一致，不是冲突: {}",
                    base_version, mutation.id
                );
                return None;
            }
        }

        let fresh_create = mutation.kind == MutationKind::Create && sides.base.is_none();
        let conflict_type = match (sides.local.is_some(), sides.remote.is_some()) {
            (false, false) => return None,
            (true, true) if fresh_create => ConflictType::CreateCreate,
            (true, true) => ConflictType::UpdateUpdate,
            // 新建的实体在远端不存在，只是正常创建
            (true, false) if fresh_create => return None,
            (true, false) => ConflictType::UpdateDelete,
            (false, true) => ConflictType::DeleteUpdate,
        };

        let field_changes = self.diff(
            sides.base.as_ref(),
            sides.local.as_ref(),
            sides.remote.as_ref(),
        );

        let conflict = Conflict {
            id: ConflictId::for_mutation(&mutation.id),
            conflict_type,
            mutation_id: mutation.id.clone(),
            entity_type: mutation.entity_type.clone(),
            entity_id: mutation.entity_id.clone(),
            base: sides.base,
            local: sides.local,
            remote: sides.remote,
            local_metadata: sides.local_metadata,
            remote_metadata: sides.remote_metadata,
            field_changes,
            detected_at,
            strategy: None,
            resolved: false,
            resolved_snapshot: None,
            resolved_by: None,
            resolved_at: None,
        };

        debug!(
            "检测到冲突 {}: type={}, conflicting_fields={:?}",
            conflict.id,
            conflict.conflict_type,
            conflict.conflicting_fields()
        );
        Some(conflict)
    }

    /// 字段级差异，只包含至少一侧发生变化的字段
    pub fn diff(
        &self,
        base: Option<&Value>,
        local: Option<&Value>,
        remote: Option<&Value>,
    ) -> Vec<FieldChange> {
        let empty = Map::new();
        let base_map = base.and_then(Value::as_object).unwrap_or(&empty);
        let local_map = local.and_then(Value::as_object).unwrap_or(&empty);
        let remote_map = remote.and_then(Value::as_object).unwrap_or(&empty);

        let fields: BTreeSet<&String> = base_map
            .keys()
            .chain(local_map.keys())
            .chain(remote_map.keys())
            .filter(|field| !self.ignored_fields.contains(field.as_str()))
            .collect();

        fields
            .into_iter()
            .filter_map(|field| {
                let comparator = self.comparator(field);
                let b = base_map.get(field);
                let l = local_map.get(field);
                let r = remote_map.get(field);

                let local_changed = !comparator.equals(l, b);
                let remote_changed = !comparator.equals(r, b);
                if !local_changed && !remote_changed {
                    return None;
                }

                Some(FieldChange {
                    field: field.clone(),
                    base: b.cloned(),
                    local: l.cloned(),
                    remote: r.cloned(),
                    local_changed,
                    remote_changed,
                    has_conflict: local_changed && remote_changed && !comparator.equals(l, r),
                    resolved: None,
                })
            })
            .collect()
    }
}
