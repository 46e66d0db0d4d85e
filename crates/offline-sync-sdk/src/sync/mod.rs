//! 同步协调
//!
//! 本模块提供：
//! - [`SyncCoordinator`]：单个 drain 周期的状态机（Idle → Gating → Draining → 结束状态）
//! - [`SyncScheduler`]：把连接恢复、周期唤醒、手动请求三类调度源汇入协调器
//! - [`SyncStatusReporter`]：对外发布 [`SyncStatus`]
//! - [`remote`]：远端应用与认证刷新契约

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::device::SkipReason;

pub mod coordinator;
pub mod remote;
pub mod scheduler;
pub mod status;

pub use coordinator::{CoordinatorConfig, SyncCoordinator};
pub use remote::{ApplyOutcome, AuthRefresher, NoAuthRefresh, RemoteApply, RemoteError};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SyncScheduler};
pub use status::SyncStatusReporter;

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Syncing,
    /// 本周期全部处理完成
    Synced,
    /// 周期因致命错误结束
    Failed,
    /// 仍有未解决的冲突
    Conflicts,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Synced => write!(f, "synced"),
            SyncState::Failed => write!(f, "failed"),
            SyncState::Conflicts => write!(f, "conflicts"),
        }
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Online,
    Offline,
    Connecting,
    Unknown,
}

impl ConnectionStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionStatus::Online)
    }
}

/// 协调器状态机阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinatorPhase {
    Idle,
    Gating,
    Draining,
}

/// 触发 drain 周期的调度源
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncTrigger {
    /// 网络从离线恢复
    ConnectivityRestored,
    /// 宿主的周期唤醒，带标签
    Periodic { tag: String },
    /// 用户手动请求
    Manual,
    /// 退避时间到期
    RetryBackoff,
}

impl SyncTrigger {
    pub fn is_manual(&self) -> bool {
        matches!(self, SyncTrigger::Manual)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncTrigger::ConnectivityRestored => "connectivity_restored",
            SyncTrigger::Periodic { .. } => "periodic",
            SyncTrigger::Manual => "manual",
            SyncTrigger::RetryBackoff => "retry_backoff",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Periodic { tag } => write!(f, "periodic({})", tag),
            other => f.write_str(other.name()),
        }
    }
}

/// 同步状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub connection_status: ConnectionStatus,
    pub sync_state: SyncState,
    pub phase: CoordinatorPhase,
    pub pending_changes: usize,
    pub unresolved_conflicts: usize,
    /// 0-100
    pub progress: u8,
    pub last_successful_sync: Option<i64>,
    pub last_attempted_sync: Option<i64>,
    pub auto_sync: bool,
    pub last_skip_reason: Option<SkipReason>,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            connection_status: ConnectionStatus::Unknown,
            sync_state: SyncState::Idle,
            phase: CoordinatorPhase::Idle,
            pending_changes: 0,
            unresolved_conflicts: 0,
            progress: 0,
            last_successful_sync: None,
            last_attempted_sync: None,
            auto_sync: true,
            last_skip_reason: None,
            last_error: None,
        }
    }
}

/// drain 周期的最终结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// 门控拒绝或已有周期在运行，队列未被修改
    Skipped(SkipReason),
    Synced,
    Conflicts,
    Failed(String),
}

/// 单个 drain 周期的报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub trigger: SyncTrigger,
    pub outcome: CycleOutcome,
    pub started_at: i64,
    pub finished_at: i64,
    pub applied: usize,
    pub retried: usize,
    pub failed: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    /// 已出队但未尝试、放回 Pending 的数量
    pub deferred: usize,
    pub cancelled: bool,
    pub deadline_reached: bool,
}

impl CycleReport {
    pub(crate) fn new(trigger: SyncTrigger, started_at: i64) -> Self {
        Self {
            trigger,
            outcome: CycleOutcome::Synced,
            started_at,
            finished_at: started_at,
            applied: 0,
            retried: 0,
            failed: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            deferred: 0,
            cancelled: false,
            deadline_reached: false,
        }
    }

    pub fn skipped(trigger: SyncTrigger, reason: SkipReason, now: i64) -> Self {
        Self {
            outcome: CycleOutcome::Skipped(reason),
            ..Self::new(trigger, now)
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Skipped(_))
    }

    /// 本周期处理过的变更数（不含 deferred）
    pub fn processed(&self) -> usize {
        self.applied + self.retried + self.failed + self.conflicts_detected
    }
}
