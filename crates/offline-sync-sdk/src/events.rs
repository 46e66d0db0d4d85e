//! 事件系统 - 同步引擎的发布/订阅通道
//!
//! 本模块提供：
//! - 基于 broadcast 的事件分发
//! - 按事件类型注册的监听器（`"*"` 匹配全部事件）
//! - 事件过滤与统计

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::conflict::{ConflictId, ConflictType, ResolutionOutcome};
use crate::device::SkipReason;
use crate::queue::{MutationId, MutationKind};
use crate::sync::{ConnectionStatus, CycleReport, SyncState, SyncTrigger};

/// 同步引擎事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    MutationEnqueued {
        mutation_id: MutationId,
        kind: MutationKind,
        entity_type: String,
        entity_id: Option<String>,
        timestamp: i64,
    },
    MutationApplied {
        mutation_id: MutationId,
        entity_type: String,
        entity_id: Option<String>,
        new_version: Option<u64>,
        timestamp: i64,
    },
    MutationRetryScheduled {
        mutation_id: MutationId,
        retry_count: u32,
        not_before: i64,
        error: String,
        timestamp: i64,
    },
    /// 变更进入 Failed 终态；optimistic 为 true 时 UI 需要用 previous_payload 回滚
    MutationFailed {
        mutation_id: MutationId,
        entity_type: String,
        entity_id: Option<String>,
        error: String,
        optimistic: bool,
        previous_payload: Option<Value>,
        timestamp: i64,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        mutation_id: MutationId,
        entity_type: String,
        entity_id: Option<String>,
        conflict_type: ConflictType,
        timestamp: i64,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        outcome: ResolutionOutcome,
        automatic: bool,
        timestamp: i64,
    },
    SyncSkipped {
        trigger: SyncTrigger,
        reason: SkipReason,
        timestamp: i64,
    },
    SyncStateChanged {
        old_state: SyncState,
        new_state: SyncState,
        timestamp: i64,
    },
    ConnectionStatusChanged {
        old_status: ConnectionStatus,
        new_status: ConnectionStatus,
        timestamp: i64,
    },
    SyncProgress {
        processed: usize,
        total: usize,
        percentage: u8,
        timestamp: i64,
    },
    CycleCompleted {
        report: CycleReport,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型名称
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::MutationEnqueued { .. } => "mutation_enqueued",
            SyncEvent::MutationApplied { .. } => "mutation_applied",
            SyncEvent::MutationRetryScheduled { .. } => "mutation_retry_scheduled",
            SyncEvent::MutationFailed { .. } => "mutation_failed",
            SyncEvent::ConflictDetected { .. } => "conflict_detected",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::SyncSkipped { .. } => "sync_skipped",
            SyncEvent::SyncStateChanged { .. } => "sync_state_changed",
            SyncEvent::ConnectionStatusChanged { .. } => "connection_status_changed",
            SyncEvent::SyncProgress { .. } => "sync_progress",
            SyncEvent::CycleCompleted { .. } => "cycle_completed",
        }
    }

    /// 获取事件时间戳（UTC 毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::MutationEnqueued { timestamp, .. }
            | SyncEvent::MutationApplied { timestamp, .. }
            | SyncEvent::MutationRetryScheduled { timestamp, .. }
            | SyncEvent::MutationFailed { timestamp, .. }
            | SyncEvent::ConflictDetected { timestamp, .. }
            | SyncEvent::ConflictResolved { timestamp, .. }
            | SyncEvent::SyncSkipped { timestamp, .. }
            | SyncEvent::SyncStateChanged { timestamp, .. }
            | SyncEvent::ConnectionStatusChanged { timestamp, .. }
            | SyncEvent::SyncProgress { timestamp, .. }
            | SyncEvent::CycleCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// 事件关联的实体类型
    pub fn entity_type(&self) -> Option<&str> {
        match self {
            SyncEvent::MutationEnqueued { entity_type, .. }
            | SyncEvent::MutationApplied { entity_type, .. }
            | SyncEvent::MutationFailed { entity_type, .. }
            | SyncEvent::ConflictDetected { entity_type, .. } => Some(entity_type),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub entity_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_entity_types(mut self, entity_types: Vec<String>) -> Self {
        self.entity_types = Some(entity_types);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref entity_types) = self.entity_types {
            match event.entity_type() {
                Some(entity_type) if entity_types.iter().any(|t| t == entity_type) => {}
                // 事件没有实体类型但过滤器要求有
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 失败属正常情况
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("No active receivers for event: {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅匹配过滤器的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
