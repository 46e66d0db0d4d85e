use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::device::SkipReason;
use crate::events::{EventManager, SyncEvent};
use crate::sync::{ConnectionStatus, CoordinatorPhase, SyncState, SyncStatus};
use crate::utils::Clock;

/// 同步状态发布者
///
/// 只有协调器和引擎修改状态；外部通过 [`snapshot`](Self::snapshot)
/// 或 [`subscribe`](Self::subscribe) 只读观察
#[derive(Debug)]
pub struct SyncStatusReporter {
    status: RwLock<SyncStatus>,
    sender: watch::Sender<SyncStatus>,
    events: Arc<EventManager>,
    clock: Arc<dyn Clock>,
}

impl SyncStatusReporter {
    pub fn new(events: Arc<EventManager>, clock: Arc<dyn Clock>, auto_sync: bool) -> Self {
        let initial = SyncStatus {
            auto_sync,
            ..SyncStatus::default()
        };
        let (sender, _) = watch::channel(initial.clone());
        Self {
            status: RwLock::new(initial),
            sender,
            events,
            clock,
        }
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.sender.subscribe()
    }

    fn update<F>(&self, f: F) -> SyncStatus
    where
        F: FnOnce(&mut SyncStatus),
    {
        let snapshot = {
            let mut status = self.status.write();
            f(&mut status);
            status.clone()
        };
        self.sender.send_replace(snapshot.clone());
        snapshot
    }

    pub async fn set_state(&self, new_state: SyncState) {
        let mut old_state = new_state;
        self.update(|status| {
            old_state = status.sync_state;
            status.sync_state = new_state;
        });

        if old_state != new_state {
            debug!("同步状态: {} -> {}", old_state, new_state);
            self.events
                .emit(SyncEvent::SyncStateChanged {
                    old_state,
                    new_state,
                    timestamp: self.clock.now_ms(),
                })
                .await;
        }
    }

    pub fn set_phase(&self, phase: CoordinatorPhase) {
        self.update(|status| status.phase = phase);
    }

    /// 更新连接状态，返回是否从非在线变为在线
    pub async fn set_connection(&self, new_status: ConnectionStatus) -> bool {
        let mut old_status = new_status;
        self.update(|status| {
            old_status = status.connection_status;
            status.connection_status = new_status;
        });

        if old_status == new_status {
            return false;
        }
        self.events
            .emit(SyncEvent::ConnectionStatusChanged {
                old_status,
                new_status,
                timestamp: self.clock.now_ms(),
            })
            .await;
        new_status.is_online()
    }

    pub fn set_counts(&self, pending_changes: usize, unresolved_conflicts: usize) {
        self.update(|status| {
            status.pending_changes = pending_changes;
            status.unresolved_conflicts = unresolved_conflicts;
        });
    }

    /// 更新进度百分比并发布进度事件
    pub async fn set_progress(&self, processed: usize, total: usize) {
        let percentage = progress_percentage(processed, total);
        self.update(|status| status.progress = percentage);
        self.events
            .emit(SyncEvent::SyncProgress {
                processed,
                total,
                percentage,
                timestamp: self.clock.now_ms(),
            })
            .await;
    }

    pub fn record_attempt(&self, now_ms: i64) {
        self.update(|status| {
            status.last_attempted_sync = Some(now_ms);
            status.last_error = None;
            status.progress = 0;
        });
    }

    pub fn record_success(&self, now_ms: i64) {
        self.update(|status| {
            status.last_successful_sync = Some(now_ms);
            status.progress = 100;
        });
    }

    pub fn record_skip(&self, reason: SkipReason) {
        self.update(|status| status.last_skip_reason = Some(reason));
    }

    pub fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|status| status.last_error = Some(error));
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        self.update(|status| status.auto_sync = enabled);
    }

    pub fn auto_sync_enabled(&self) -> bool {
        self.status.read().auto_sync
    }
}

/// 进度百分比，总数为 0 时视为完成
pub fn progress_percentage(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let percentage = processed.min(total) * 100 / total;
    u8::try_from(percentage).unwrap_or(100)
}
