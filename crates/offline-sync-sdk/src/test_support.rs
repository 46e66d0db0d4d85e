//! 测试辅助：可编排的远端、静态设备探针、计数的认证刷新和组装好的协调器

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::conflict::{ChangeMetadata, ConflictLog, CustomResolver, ResolutionConfig, ResolutionEngine};
use crate::device::{BatteryInfo, DeviceConditionGate, DeviceProbe, GateConfig, NetworkInfo, StorageInfo};
use crate::events::EventManager;
use crate::queue::{MutationId, MutationKind, OfflineQueue, QueueConfig, QueuedMutation, RetryPolicy};
use crate::storage::{MemoryQueueStore, QueueStore};
use crate::sync::coordinator::CoordinatorParts;
use crate::sync::{
    ApplyOutcome, AuthRefresher, CoordinatorConfig, RemoteApply, RemoteError, SyncCoordinator,
    SyncStatusReporter,
};
use crate::utils::{Clock, ManualClock, TimezoneConfig};

pub const T0: i64 = 1_700_000_000_000;

pub fn fixed_clock() -> Arc<ManualClock> {
    ManualClock::new(T0)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// 按变更 ID 编排响应的远端，未编排的变更直接应用成功
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    responses: Mutex<HashMap<MutationId, VecDeque<Result<ApplyOutcome, RemoteError>>>>,
    calls: Mutex<Vec<MutationId>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    /// 每次调用推进的时钟
    clock_step: Mutex<Option<(Arc<ManualClock>, i64)>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, id: &MutationId, response: Result<ApplyOutcome, RemoteError>) {
        self.responses
            .lock()
            .entry(id.clone())
            .or_default()
            .push_back(response);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn advance_clock_per_call(&self, clock: Arc<ManualClock>, step_ms: i64) {
        *self.clock_step.lock() = Some((clock, step_ms));
    }

    pub fn calls(&self) -> Vec<MutationId> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, id: &MutationId) -> usize {
        self.calls.lock().iter().filter(|call| *call == id).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self, id: &MutationId) -> Result<ApplyOutcome, RemoteError> {
        self.responses
            .lock()
            .get_mut(id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(ApplyOutcome::Applied { new_version: None }))
    }
}

#[async_trait]
impl RemoteApply for ScriptedRemote {
    async fn apply(&self, mutation: &QueuedMutation) -> Result<ApplyOutcome, RemoteError> {
        self.calls.lock().push(mutation.id.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((clock, step)) = self.clock_step.lock().clone() {
            clock.advance_ms(step);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.next_response(&mutation.id)
    }
}

pub fn conflict_response(remote: Option<Value>, timestamp: i64, version: u64) -> Result<ApplyOutcome, RemoteError> {
    Ok(ApplyOutcome::Conflict {
        remote_snapshot: remote,
        remote_metadata: ChangeMetadata::new("remote-user", timestamp, version),
    })
}

/// 固定返回的设备探针
#[derive(Debug, Clone)]
pub struct StaticProbe {
    pub network: NetworkInfo,
    pub battery: Option<BatteryInfo>,
    pub storage: Option<StorageInfo>,
}

impl StaticProbe {
    pub fn online() -> Self {
        Self {
            network: NetworkInfo::default(),
            battery: None,
            storage: None,
        }
    }

    pub fn with_battery(level: f64, charging: bool) -> Self {
        Self {
            battery: Some(BatteryInfo {
                level,
                charging,
                power_save: false,
            }),
            ..Self::online()
        }
    }
}

#[async_trait]
impl DeviceProbe for StaticProbe {
    async fn battery(&self) -> Option<BatteryInfo> {
        self.battery
    }

    async fn network(&self) -> NetworkInfo {
        self.network
    }

    async fn storage(&self) -> Option<StorageInfo> {
        self.storage
    }
}

/// 记录调用次数的认证刷新
#[derive(Debug)]
pub struct CountingAuth {
    calls: AtomicU32,
    succeed: bool,
}

impl CountingAuth {
    pub fn new(succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            succeed,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthRefresher for CountingAuth {
    async fn refresh(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(())
        } else {
            Err(RemoteError::AuthExpired)
        }
    }
}

/// 组装好的协调器及其依赖
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: MemoryQueueStore,
    pub queue: Arc<OfflineQueue>,
    pub events: Arc<EventManager>,
    pub status: Arc<SyncStatusReporter>,
    pub resolver: Arc<ResolutionEngine>,
    pub remote: Arc<ScriptedRemote>,
    pub auth: Arc<CountingAuth>,
    pub coordinator: Arc<SyncCoordinator>,
}

/// 构造协调器的选项
#[derive(Clone)]
pub struct HarnessOptions {
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub gate: GateConfig,
    pub probe: StaticProbe,
    pub resolution: ResolutionConfig,
    pub coordinator: CoordinatorConfig,
    pub custom: Option<Arc<dyn CustomResolver>>,
    pub auth_succeeds: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            gate: GateConfig::default(),
            probe: StaticProbe::online(),
            resolution: ResolutionConfig::default().with_clock_skew_tolerance_ms(0),
            coordinator: CoordinatorConfig::default(),
            custom: None,
            auth_succeeds: true,
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        Self::open(options, MemoryQueueStore::new(), fixed_clock()).await
    }

    /// 在已有存储上重新组装（模拟重启）
    pub async fn open(options: HarnessOptions, store: MemoryQueueStore, clock: Arc<ManualClock>) -> Self {
        let shared: Arc<dyn QueueStore> = Arc::new(store.clone());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let events = Arc::new(EventManager::new(256));
        let queue = Arc::new(
            OfflineQueue::open(shared.clone(), options.queue, options.retry, dyn_clock.clone())
                .await
                .unwrap(),
        );
        let log = Arc::new(ConflictLog::open(shared.clone()).await.unwrap());
        let detector = options.resolution.detector();
        let resolver = Arc::new(
            ResolutionEngine::open(
                options.resolution,
                shared,
                queue.clone(),
                log,
                options.custom,
                events.clone(),
                dyn_clock.clone(),
            )
            .await
            .unwrap(),
        );
        let status = Arc::new(SyncStatusReporter::new(events.clone(), dyn_clock.clone(), true));
        let gate = Arc::new(DeviceConditionGate::new(
            options.gate,
            Arc::new(options.probe),
            TimezoneConfig::default(),
        ));
        let remote = ScriptedRemote::new();
        let auth = CountingAuth::new(options.auth_succeeds);
        let coordinator = Arc::new(SyncCoordinator::new(
            options.coordinator,
            CoordinatorParts {
                queue: queue.clone(),
                gate,
                remote: remote.clone(),
                auth: auth.clone(),
                detector,
                resolver: resolver.clone(),
                status: status.clone(),
                events: events.clone(),
                clock: dyn_clock,
            },
        ));

        Self {
            clock,
            store,
            queue,
            events,
            status,
            resolver,
            remote,
            auth,
            coordinator,
        }
    }

    /// 以当前时钟入队一条变更
    pub async fn enqueue(&self, mutation: QueuedMutation) -> QueuedMutation {
        self.queue.enqueue(mutation).await.unwrap()
    }
}

pub fn update(entity_id: &str, payload: Value) -> QueuedMutation {
    QueuedMutation::new(
        MutationKind::Update,
        "item",
        Some(entity_id.to_string()),
        payload,
        "user-1",
    )
}

pub fn create(payload: Value) -> QueuedMutation {
    QueuedMutation::new(MutationKind::Create, "item", None, payload, "user-1")
}
