//! 同步调度器
//!
//! 把四类调度源汇入同一个后台任务，串行调用 [`SyncCoordinator::run_cycle`]：
//! - 网络从离线恢复（订阅 [`NetworkMonitor`]）
//! - 宿主的周期唤醒（间隔不低于协调器的最小周期间隔）
//! - 手动请求（通过 [`SchedulerHandle`]）
//! - 队列中最早的退避到期

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::network::NetworkMonitor;
use crate::queue::OfflineQueue;
use crate::sync::coordinator::SyncCoordinator;
use crate::sync::status::SyncStatusReporter;
use crate::sync::{CycleReport, SyncTrigger};
use crate::utils::Clock;

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 周期唤醒间隔（毫秒），None 表示不做周期同步
    pub periodic_interval_ms: Option<u64>,
    /// 周期唤醒的标签
    pub periodic_tag: String,
    /// 手动请求通道容量
    pub request_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            periodic_interval_ms: None,
            periodic_tag: "offline-sync".to_string(),
            request_buffer: 16,
        }
    }
}

/// 调度器句柄
#[derive(Debug)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SyncTrigger>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    /// 请求一次同步；通道已满时丢弃（已有请求在排队）
    pub fn request(&self, trigger: SyncTrigger) -> Result<()> {
        match self.sender.try_send(trigger) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(trigger)) => {
                debug!("同步请求已在排队，忽略 {}", trigger);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SyncError::InvalidState("scheduler is stopped".to_string()))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.sender.is_closed()
    }

    /// 停止调度器并等待后台任务退出
    ///
    /// 进行中的周期会停止出队，已发出的远端调用会完成
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("调度任务异常退出: {}", e);
            }
        }
        info!("同步调度器已停止");
    }
}

/// 同步调度器
#[derive(Debug)]
pub struct SyncScheduler {
    config: SchedulerConfig,
    coordinator: Arc<SyncCoordinator>,
    queue: Arc<OfflineQueue>,
    status: Arc<SyncStatusReporter>,
    monitor: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
}

impl SyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        coordinator: Arc<SyncCoordinator>,
        queue: Arc<OfflineQueue>,
        status: Arc<SyncStatusReporter>,
        monitor: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            coordinator,
            queue,
            status,
            monitor,
            clock,
        }
    }

    /// 实际使用的周期间隔，不低于协调器的最小间隔
    pub fn periodic_interval(&self) -> Option<Duration> {
        let floor = self.coordinator.config().min_periodic_interval_ms;
        self.config
            .periodic_interval_ms
            .map(|ms| Duration::from_millis(ms.max(floor).max(1)))
    }

    /// 启动后台调度任务
    pub fn start(self) -> SchedulerHandle {
        let (sender, receiver) = mpsc::channel(self.config.request_buffer.max(1));
        let cancel = CancellationToken::new();
        let network = self.monitor.subscribe();

        info!(
            "同步调度器启动: periodic={:?}",
            self.periodic_interval().map(|d| d.as_millis())
        );

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            self.run(receiver, network, task_cancel).await;
        });

        SchedulerHandle {
            sender,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(
        self,
        mut receiver: mpsc::Receiver<SyncTrigger>,
        mut network: broadcast::Receiver<crate::network::NetworkStatusEvent>,
        cancel: CancellationToken,
    ) {
        let mut periodic = self.periodic_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        let mut retry_at = self.queue.next_retry_at().await;

        loop {
            let retry_delay = retry_at.map(|at| {
                let delta = at.saturating_sub(self.clock.now_ms()).max(0);
                Duration::from_millis(u64::try_from(delta).unwrap_or(0))
            });

            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                request = receiver.recv() => match request {
                    Some(trigger) => trigger,
                    None => break,
                },
                event = network.recv() => match event {
                    Ok(event) => {
                        if self.status.set_connection(event.new_status).await {
                            SyncTrigger::ConnectivityRestored
                        } else {
                            continue;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("网络事件滞后，跳过 {} 条", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = next_tick(&mut periodic) => SyncTrigger::Periodic {
                    tag: self.config.periodic_tag.clone(),
                },
                _ = sleep_for(retry_delay) => SyncTrigger::RetryBackoff,
            };

            let report = self.coordinator.run_cycle(trigger, &cancel).await;
            retry_at = self.next_retry_after(&report).await;
        }

        debug!("同步调度任务退出");
    }

    /// 被门控跳过的退避触发不再重复计时，等待其他调度源
    async fn next_retry_after(&self, report: &CycleReport) -> Option<i64> {
        if report.is_skipped() && report.trigger == SyncTrigger::RetryBackoff {
            return None;
        }
        self.queue.next_retry_at().await
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}
