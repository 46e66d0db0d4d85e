use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::sync::ConnectionStatus;
use crate::utils::Clock;

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatusEvent {
    pub old_status: ConnectionStatus,
    pub new_status: ConnectionStatus,
    pub timestamp: i64,
}

impl NetworkStatusEvent {
    /// 从非在线变为在线
    pub fn is_restored(&self) -> bool {
        !self.old_status.is_online() && self.new_status.is_online()
    }
}

/// 网络状态监听器（由平台层实现，如 Android/iOS）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> ConnectionStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<ConnectionStatus>>,
    clock: Arc<dyn Clock>,
    listener: RwLock<Option<Arc<dyn NetworkStatusListener>>>,
    cancel: CancellationToken,
}

impl NetworkMonitor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            status_sender,
            current_status: Arc::new(RwLock::new(ConnectionStatus::Unknown)),
            clock,
            listener: RwLock::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// 接入平台监听器，转发其状态变化
    pub async fn start(&self, listener: Arc<dyn NetworkStatusListener>) -> Result<()> {
        let initial = listener.get_current_status().await;
        self.set_status(initial).await;

        let mut receiver = listener.start_monitoring().await?;
        *self.listener.write().await = Some(listener);

        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("网络事件滞后，跳过 {} 条", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let old_status = {
                    let mut status = current_status.write().await;
                    std::mem::replace(&mut *status, event.new_status)
                };
                if old_status == event.new_status {
                    continue;
                }
                let _ = status_sender.send(NetworkStatusEvent {
                    old_status,
                    new_status: event.new_status,
                    timestamp: event.timestamp,
                });
            }
            debug!("网络监听任务退出");
        });

        info!("网络监控已启动");
        Ok(())
    }

    /// 停止监听平台事件
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(listener) = self.listener.write().await.take() {
            listener.stop_monitoring().await;
        }
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> ConnectionStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态，状态不变时不广播
    pub async fn set_status(&self, new_status: ConnectionStatus) -> Option<NetworkStatusEvent> {
        let old_status = {
            let mut status = self.current_status.write().await;
            std::mem::replace(&mut *status, new_status)
        };
        if old_status == new_status {
            return None;
        }

        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: self.clock.now_ms(),
        };
        let _ = self.status_sender.send(event.clone());
        Some(event)
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    pub async fn is_online(&self) -> bool {
        self.get_status().await.is_online()
    }
}
