//! 离线同步引擎
//!
//! [`OfflineSyncEngine`] 是显式的上下文对象：由配置和注入的协作者
//! （远端、认证刷新、设备探针、自定义解决钩子、时钟、存储）组装出
//! 队列、冲突引擎、门控、协调器和状态发布者，没有任何全局状态。

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::OfflineSyncConfig;
use crate::conflict::{
    Conflict, ConflictId, ConflictLog, ConflictLogEntry, CustomResolver, ResolutionAction,
    ResolutionEngine,
};
use crate::device::{DeviceConditionGate, DeviceProbe};
use crate::error::Result;
use crate::events::{EventManager, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatusListener};
use crate::queue::{MutationId, OfflineQueue, QueueStats, QueuedMutation};
use crate::storage::{KvStore, QueueStore, SledQueueStore};
use crate::sync::coordinator::CoordinatorParts;
use crate::sync::{
    AuthRefresher, ConnectionStatus, CycleReport, NoAuthRefresh, RemoteApply, SchedulerHandle,
    SyncCoordinator, SyncScheduler, SyncStatus, SyncStatusReporter, SyncTrigger,
};
use crate::utils::{Clock, SystemClock};

/// 引擎依赖的外部协作者
pub struct EngineCollaborators {
    pub remote: Arc<dyn RemoteApply>,
    pub probe: Arc<dyn DeviceProbe>,
    pub auth: Arc<dyn AuthRefresher>,
    pub custom_resolver: Option<Arc<dyn CustomResolver>>,
    pub clock: Arc<dyn Clock>,
    /// 未提供时使用 `<data_dir>/kv` 下的 sled 存储
    pub store: Option<Arc<dyn QueueStore>>,
    pub network_listener: Option<Arc<dyn NetworkStatusListener>>,
}

impl EngineCollaborators {
    pub fn new(remote: Arc<dyn RemoteApply>, probe: Arc<dyn DeviceProbe>) -> Self {
        Self {
            remote,
            probe,
            auth: Arc::new(NoAuthRefresh),
            custom_resolver: None,
            clock: Arc::new(SystemClock),
            store: None,
            network_listener: None,
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthRefresher>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_custom_resolver(mut self, resolver: Arc<dyn CustomResolver>) -> Self {
        self.custom_resolver = Some(resolver);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_network_listener(mut self, listener: Arc<dyn NetworkStatusListener>) -> Self {
        self.network_listener = Some(listener);
        self
    }
}

/// 离线同步引擎
pub struct OfflineSyncEngine {
    config: OfflineSyncConfig,
    /// sled 数据库，使用注入存储时为空
    kv: Option<KvStore>,
    queue: Arc<OfflineQueue>,
    resolver: Arc<ResolutionEngine>,
    events: Arc<EventManager>,
    status: Arc<SyncStatusReporter>,
    coordinator: Arc<SyncCoordinator>,
    monitor: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    /// 直接触发的周期共用的取消令牌
    cancel: CancellationToken,
}

impl std::fmt::Debug for OfflineSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineSyncEngine")
            .field("user_id", &self.config.user_id)
            .field("sled", &self.kv.as_ref().map(|kv| kv.base_path()))
            .finish()
    }
}

impl OfflineSyncEngine {
    /// 校验配置并组装全部组件，恢复持久化的队列和冲突
    #[instrument(skip_all, fields(user_id = %config.user_id))]
    pub async fn open(config: OfflineSyncConfig, collaborators: EngineCollaborators) -> Result<Self> {
        config.validate()?;
        let clock = collaborators.clock;

        let (kv, store) = match collaborators.store {
            Some(store) => (None, store),
            None => {
                let kv = KvStore::new(&config.data_dir).await?;
                let store: Arc<dyn QueueStore> =
                    Arc::new(SledQueueStore::open(&kv, &config.user_id).await?);
                (Some(kv), store)
            }
        };

        let events = Arc::new(EventManager::new(config.events.buffer_size));
        let queue = Arc::new(
            OfflineQueue::open(
                store.clone(),
                config.queue.clone(),
                config.retry.clone(),
                clock.clone(),
            )
            .await?,
        );
        let log = Arc::new(ConflictLog::open(store.clone()).await?);
        let detector = config.resolution.detector();
        let resolver = Arc::new(
            ResolutionEngine::open(
                config.resolution.clone(),
                store,
                queue.clone(),
                log,
                collaborators.custom_resolver,
                events.clone(),
                clock.clone(),
            )
            .await?,
        );
        let status = Arc::new(SyncStatusReporter::new(
            events.clone(),
            clock.clone(),
            config.auto_sync,
        ));
        let gate = Arc::new(DeviceConditionGate::new(
            config.gate.clone(),
            collaborators.probe,
            config.timezone(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            config.coordinator.clone(),
            CoordinatorParts {
                queue: queue.clone(),
                gate,
                remote: collaborators.remote,
                auth: collaborators.auth,
                detector,
                resolver: resolver.clone(),
                status: status.clone(),
                events: events.clone(),
                clock: clock.clone(),
            },
        ));

        let monitor = Arc::new(NetworkMonitor::new(clock.clone()));
        if let Some(listener) = collaborators.network_listener {
            monitor.start(listener).await?;
            status.set_connection(monitor.get_status().await).await;
        }

        let engine = Self {
            config,
            kv,
            queue,
            resolver,
            events,
            status,
            coordinator,
            monitor,
            clock,
            scheduler: Mutex::new(None),
            cancel: CancellationToken::new(),
        };
        engine.refresh_counts().await;

        info!("离线同步引擎已启动: {:?}", engine.queue.stats().await);
        Ok(engine)
    }

    pub fn config(&self) -> &OfflineSyncConfig {
        &self.config
    }

    /// 记录一条本地变更
    pub async fn enqueue(&self, mutation: QueuedMutation) -> Result<QueuedMutation> {
        let mutation = self.queue.enqueue(mutation).await?;
        self.events
            .emit(SyncEvent::MutationEnqueued {
                mutation_id: mutation.id.clone(),
                kind: mutation.kind,
                entity_type: mutation.entity_type.clone(),
                entity_id: mutation.entity_id.clone(),
                timestamp: self.clock.now_ms(),
            })
            .await;
        self.refresh_counts().await;
        Ok(mutation)
    }

    /// 手动触发一次同步，直接返回本周期的报告
    pub async fn sync_now(&self) -> CycleReport {
        self.coordinator
            .run_cycle(SyncTrigger::Manual, &self.cancel)
            .await
    }

    /// 平台报告的网络状态
    ///
    /// 调度器运行时由调度器处理恢复事件，返回 None；
    /// 否则网络恢复时直接执行一个周期并返回报告。
    pub async fn notify_connectivity(&self, status: ConnectionStatus) -> Option<CycleReport> {
        self.monitor.set_status(status).await;
        if self.scheduler_running().await {
            return None;
        }
        if !self.status.set_connection(status).await {
            return None;
        }
        Some(
            self.coordinator
                .run_cycle(SyncTrigger::ConnectivityRestored, &self.cancel)
                .await,
        )
    }

    /// 宿主的周期唤醒（如后台任务）
    pub async fn on_periodic_wakeup(&self, tag: impl Into<String>) -> CycleReport {
        self.coordinator
            .run_cycle(SyncTrigger::Periodic { tag: tag.into() }, &self.cancel)
            .await
    }

    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub async fn unresolved_conflicts(&self) -> Vec<Conflict> {
        self.resolver.unresolved().await
    }

    pub async fn get_conflict(&self, id: &ConflictId) -> Option<Conflict> {
        self.resolver.get(id).await
    }

    /// 只追加的冲突解决历史
    pub async fn conflict_log(&self) -> Vec<ConflictLogEntry> {
        self.resolver.log().entries().await
    }

    /// 提交一个人工解决
    pub async fn resolve_conflict(&self, action: ResolutionAction) -> Result<ConflictLogEntry> {
        let result = self.resolver.resolve_manual(action).await;
        self.refresh_counts().await;
        result
    }

    /// 批量提交人工解决，逐个返回结果
    pub async fn resolve_batch(&self, actions: Vec<ResolutionAction>) -> Vec<Result<ConflictLogEntry>> {
        let results = self.resolver.resolve_batch(actions).await;
        self.refresh_counts().await;
        results
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        info!("自动同步: {}", enabled);
        self.status.set_auto_sync(enabled);
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub async fn get_mutation(&self, id: &MutationId) -> Option<QueuedMutation> {
        self.queue.get(id).await
    }

    pub async fn pending_mutations(&self) -> Vec<QueuedMutation> {
        self.queue.peek_pending().await
    }

    /// 启动后台调度器（网络恢复、周期、退避到期）
    pub async fn start_scheduler(&self) -> Result<()> {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.as_ref().is_some_and(|handle| handle.is_running()) {
            warn!("调度器已在运行");
            return Ok(());
        }

        let handle = SyncScheduler::new(
            self.config.scheduler.clone(),
            self.coordinator.clone(),
            self.queue.clone(),
            self.status.clone(),
            self.monitor.clone(),
            self.clock.clone(),
        )
        .start();
        *scheduler = Some(handle);
        Ok(())
    }

    /// 通过调度器请求同步；调度器未运行时直接执行
    pub async fn request_sync(&self) -> Result<Option<CycleReport>> {
        {
            let scheduler = self.scheduler.lock().await;
            if let Some(handle) = scheduler.as_ref().filter(|handle| handle.is_running()) {
                handle.request(SyncTrigger::Manual)?;
                return Ok(None);
            }
        }
        Ok(Some(self.sync_now().await))
    }

    async fn scheduler_running(&self) -> bool {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| handle.is_running())
    }

    /// 停止调度器和网络监听，进行中的周期停止出队后返回
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self.scheduler.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.monitor.stop().await;
        self.events.clear_listeners().await;
        if let Some(kv) = &self.kv {
            kv.flush().await?;
        }
        info!("离线同步引擎已关闭");
        Ok(())
    }

    async fn refresh_counts(&self) {
        let stats = self.queue.stats().await;
        let unresolved = self.resolver.unresolved_count().await;
        self.status
            .set_counts(stats.pending + stats.in_progress, unresolved);
    }
}
