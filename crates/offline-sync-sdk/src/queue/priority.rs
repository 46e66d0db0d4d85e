use crate::queue::mutation::MutationKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 变更优先级预设
///
/// 队列内部使用整数优先级（数值越大越先处理），这里提供常用档位：
/// - Critical: 由调用方显式标记的紧急操作
/// - High: 删除、批量删除
/// - Normal: 普通创建和更新
/// - Low: 批量更新
/// - Background: 统计、偏好等可延迟的同步
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl MutationPriority {
    /// 根据操作类型获取默认优先级
    pub fn from_kind(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Delete | MutationKind::BulkDelete => MutationPriority::High,
            MutationKind::Create | MutationKind::Update => MutationPriority::Normal,
            MutationKind::BulkUpdate => MutationPriority::Low,
        }
    }

    /// 获取优先级的数值
    pub fn value(&self) -> i32 {
        match self {
            MutationPriority::Critical => 100,
            MutationPriority::High => 75,
            MutationPriority::Normal => 50,
            MutationPriority::Low => 25,
            MutationPriority::Background => 0,
        }
    }

    /// 从数值取最接近的档位
    pub fn from_value(value: i32) -> Self {
        match value {
            v if v >= 100 => MutationPriority::Critical,
            v if v >= 75 => MutationPriority::High,
            v if v >= 50 => MutationPriority::Normal,
            v if v >= 25 => MutationPriority::Low,
            _ => MutationPriority::Background,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MutationPriority::Critical => "critical",
            MutationPriority::High => "high",
            MutationPriority::Normal => "normal",
            MutationPriority::Low => "low",
            MutationPriority::Background => "background",
        }
    }
}

impl fmt::Display for MutationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
