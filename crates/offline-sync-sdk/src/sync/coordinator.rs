//! 同步协调器
//!
//! 状态机：Idle → Gating → Draining → {Synced | Conflicts | Failed} → Idle
//!
//! - 每个队列同一时间只有一个 drain 周期（持久化的处理锁）
//! - 同一实体的变更在一个分组内顺序执行，不同实体的分组并发执行
//! - 取消只阻止新的出队和尚未开始的应用，进行中的远端调用总会完成
//! - 协调器从不向调用方返回错误，所有错误只体现在 [`SyncStatus`](crate::sync::SyncStatus) 和日志中

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::conflict::{ChangeMetadata, ConflictDetector, ConflictSides, Resolution, ResolutionEngine};
use crate::device::{DeviceConditionGate, GateDecision, SkipReason};
use crate::error::Result;
use crate::events::{EventManager, SyncEvent};
use crate::queue::{
    AckOutcome, AckResult, EntityKey, FailureReason, MutationId, OfflineQueue, QueuedMutation,
};
use crate::sync::remote::{ApplyOutcome, AuthRefresher, RemoteApply, RemoteError};
use crate::sync::status::SyncStatusReporter;
use crate::sync::{CoordinatorPhase, CycleOutcome, CycleReport, SyncState, SyncTrigger};
use crate::utils::{format_duration_ms, Clock};

/// 协调器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// 单个 drain 周期的最长时间（毫秒），超时后剩余变更留待下个周期
    pub max_sync_duration_ms: u64,
    /// 单次远端应用的超时（毫秒）
    pub apply_timeout_ms: u64,
    /// 周期唤醒的最小间隔（毫秒）
    pub min_periodic_interval_ms: u64,
    /// 一个周期内最多的认证刷新次数
    pub max_auth_refresh_attempts: u32,
    /// 写入本地变更元数据的设备 ID
    pub device_id: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_sync_duration_ms: 5 * 60 * 1000,
            apply_timeout_ms: 30 * 1000,
            min_periodic_interval_ms: 12 * 60 * 60 * 1000,
            max_auth_refresh_attempts: 3,
            device_id: None,
        }
    }
}

/// 协调器依赖的组件
pub struct CoordinatorParts {
    pub queue: Arc<OfflineQueue>,
    pub gate: Arc<DeviceConditionGate>,
    pub remote: Arc<dyn RemoteApply>,
    pub auth: Arc<dyn AuthRefresher>,
    pub detector: ConflictDetector,
    pub resolver: Arc<ResolutionEngine>,
    pub status: Arc<SyncStatusReporter>,
    pub events: Arc<EventManager>,
    pub clock: Arc<dyn Clock>,
}

/// 一个实体分组的处理结果
#[derive(Debug, Default)]
struct GroupResult {
    applied: usize,
    retried: usize,
    failed: usize,
    conflicts_detected: usize,
    conflicts_resolved: usize,
    deferred: usize,
    auth_expired: bool,
    /// 同一变更在本周期内再次需要 rebase，停止继续出队
    stalled: bool,
    rebased: Vec<MutationId>,
    fatal: Option<String>,
}

impl GroupResult {
    fn merge_into(self, report: &mut CycleReport, rebased: &mut HashSet<MutationId>) {
        report.applied += self.applied;
        report.retried += self.retried;
        report.failed += self.failed;
        report.conflicts_detected += self.conflicts_detected;
        report.conflicts_resolved += self.conflicts_resolved;
        report.deferred += self.deferred;
        rebased.extend(self.rebased);
    }
}

/// 单条变更处理后分组是否继续
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    /// 后续同实体变更必须等待
    Block,
}

/// 同步协调器
pub struct SyncCoordinator {
    config: CoordinatorConfig,
    batch_size: usize,
    queue: Arc<OfflineQueue>,
    gate: Arc<DeviceConditionGate>,
    remote: Arc<dyn RemoteApply>,
    auth: Arc<dyn AuthRefresher>,
    detector: ConflictDetector,
    resolver: Arc<ResolutionEngine>,
    status: Arc<SyncStatusReporter>,
    events: Arc<EventManager>,
    clock: Arc<dyn Clock>,
    /// 上一次通过门控的周期唤醒时间
    last_periodic_run: Mutex<Option<i64>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("config", &self.config)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(config: CoordinatorConfig, parts: CoordinatorParts) -> Self {
        let batch_size = parts.queue.config().batch_size.max(1);
        Self {
            config,
            batch_size,
            queue: parts.queue,
            gate: parts.gate,
            remote: parts.remote,
            auth: parts.auth,
            detector: parts.detector,
            resolver: parts.resolver,
            status: parts.status,
            events: parts.events,
            clock: parts.clock,
            last_periodic_run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// 执行一个 drain 周期
    ///
    /// 永远不返回错误，结果记录在报告和同步状态中
    #[instrument(skip(self, cancel), fields(trigger = %trigger))]
    pub async fn run_cycle(&self, trigger: SyncTrigger, cancel: &CancellationToken) -> CycleReport {
        let started_at = self.clock.now_ms();

        let last_periodic = *self.last_periodic_run.lock();
        let floor = i64::try_from(self.config.min_periodic_interval_ms).unwrap_or(i64::MAX);
        let too_early = matches!(trigger, SyncTrigger::Periodic { .. })
            && last_periodic.map_or(false, |last| started_at.saturating_sub(last) < floor);
        if too_early {
            debug!("周期唤醒 {} 早于最小间隔，忽略", trigger);
            return self
                .skip(trigger, SkipReason::Other("periodic interval floor".to_string()))
                .await;
        }

        if self.queue.is_processing().await {
            return self.skip(trigger, SkipReason::AlreadyRunning).await;
        }

        self.status.set_phase(CoordinatorPhase::Gating);
        let decision = self
            .gate
            .check(&trigger, self.status.auto_sync_enabled(), started_at)
            .await;
        if let GateDecision::Skip(reason) = decision {
            return self.skip(trigger, reason).await;
        }

        let owner = format!("cycle-{}", uuid::Uuid::new_v4());
        match self.queue.try_acquire_processing(&owner).await {
            Ok(true) => {}
            Ok(false) => return self.skip(trigger, SkipReason::AlreadyRunning).await,
            Err(e) => {
                error!("获取处理锁失败: {}", e);
                self.status.record_error(e.to_string());
                self.status.set_phase(CoordinatorPhase::Idle);
                let mut report = CycleReport::new(trigger, started_at);
                report.outcome = CycleOutcome::Failed(e.to_string());
                report.finished_at = self.clock.now_ms();
                return report;
            }
        }

        if matches!(trigger, SyncTrigger::Periodic { .. }) {
            *self.last_periodic_run.lock() = Some(started_at);
        }

        info!("🔄 开始 drain 周期: trigger={}, owner={}", trigger, owner);
        self.status.set_phase(CoordinatorPhase::Draining);
        self.status.record_attempt(started_at);
        self.status.set_state(SyncState::Syncing).await;

        let mut report = CycleReport::new(trigger, started_at);
        let fatal = self.drain(&owner, &mut report, cancel).await;

        if let Err(e) = self.queue.release_processing(&owner).await {
            warn!("释放处理锁失败: {}", e);
        }

        self.finish(report, fatal).await
    }

    async fn skip(&self, trigger: SyncTrigger, reason: SkipReason) -> CycleReport {
        let now = self.clock.now_ms();
        info!("跳过同步: trigger={}, reason={}", trigger, reason);
        self.status.record_skip(reason.clone());
        self.status.set_phase(CoordinatorPhase::Idle);
        self.events
            .emit(SyncEvent::SyncSkipped {
                trigger: trigger.clone(),
                reason: reason.clone(),
                timestamp: now,
            })
            .await;
        CycleReport::skipped(trigger, reason, now)
    }

    /// 反复出队直到没有可处理的变更、超时或被取消；返回致命错误
    async fn drain(
        &self,
        owner: &str,
        report: &mut CycleReport,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let deadline = report
            .started_at
            .saturating_add(i64::try_from(self.config.max_sync_duration_ms).unwrap_or(i64::MAX));
        let initial_pending = self.queue.stats().await.pending;
        let mut rebased: HashSet<MutationId> = HashSet::new();
        let mut auth_refreshes = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!("drain 已取消，停止出队");
                report.cancelled = true;
                return None;
            }
            if self.clock.now_ms() >= deadline {
                info!(
                    "drain 达到最长时间 {}，剩余变更留待下个周期",
                    format_duration_ms(deadline - report.started_at)
                );
                report.deadline_reached = true;
                return None;
            }

            let batch = match self.queue.dequeue_batch(self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!("出队失败: {}", e);
                    return Some(e.to_string());
                }
            };
            if batch.is_empty() {
                return None;
            }

            let groups = group_by_entity(batch);
            debug!("处理 {} 个实体分组", groups.len());
            let results = join_all(
                groups
                    .into_iter()
                    .map(|group| self.process_group(group, cancel, deadline, &rebased)),
            )
            .await;

            let mut auth_expired = false;
            let mut stalled = false;
            let mut fatal = None;
            for result in results {
                auth_expired |= result.auth_expired;
                stalled |= result.stalled;
                if fatal.is_none() {
                    fatal = result.fatal.clone();
                }
                result.merge_into(report, &mut rebased);
            }

            let processed = report.processed();
            self.status
                .set_progress(processed, initial_pending.max(processed))
                .await;

            // 每批结束续期处理锁，长周期不会被当作陈旧锁接管
            match self.queue.refresh_processing(owner).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("处理锁已不属于 {}，停止 drain", owner);
                    return None;
                }
                Err(e) => warn!("续期处理锁失败: {}", e),
            }

            if let Some(fatal) = fatal {
                return Some(fatal);
            }
            if stalled {
                warn!("变更在本周期内反复需要 rebase，停止 drain");
                return None;
            }
            if auth_expired {
                if let Err(e) = self.refresh_auth(&mut auth_refreshes).await {
                    return Some(e);
                }
            }
        }
    }

    /// 请求外部刷新认证，直到成功或用尽次数
    async fn refresh_auth(&self, attempts: &mut u32) -> std::result::Result<(), String> {
        while *attempts < self.config.max_auth_refresh_attempts {
            *attempts += 1;
            info!("认证过期，请求刷新 (attempt {})", attempts);
            match self.auth.refresh().await {
                Ok(()) => {
                    info!("认证刷新成功，继续 drain");
                    return Ok(());
                }
                Err(e) => warn!("认证刷新失败: {}", e),
            }
        }
        Err(format!(
            "auth refresh failed after {} attempts",
            self.config.max_auth_refresh_attempts
        ))
    }

    /// 顺序处理同一实体的变更；一条被阻塞后其余全部放回 Pending
    async fn process_group(
        &self,
        group: Vec<QueuedMutation>,
        cancel: &CancellationToken,
        deadline: i64,
        rebased: &HashSet<MutationId>,
    ) -> GroupResult {
        let mut result = GroupResult::default();
        let mut blocked = false;

        for mutation in group {
            if blocked
                || result.fatal.is_some()
                || cancel.is_cancelled()
                || self.clock.now_ms() >= deadline
            {
                match self.queue.ack(&mutation.id, AckOutcome::Deferred).await {
                    Ok(_) => result.deferred += 1,
                    Err(e) => {
                        error!("放回变更 {} 失败: {}", mutation.id, e);
                        result.fatal.get_or_insert_with(|| e.to_string());
                    }
                }
                continue;
            }

            match self.process_one(&mutation, rebased, &mut result).await {
                Ok(Step::Continue) => {}
                Ok(Step::Block) => blocked = true,
                Err(e) => {
                    error!("处理变更 {} 失败: {}", mutation.id, e);
                    result.fatal = Some(e.to_string());
                }
            }
        }
        result
    }

    async fn process_one(
        &self,
        mutation: &QueuedMutation,
        rebased: &HashSet<MutationId>,
        result: &mut GroupResult,
    ) -> Result<Step> {
        debug!(
            "应用变更: id={}, kind={}, entity={}/{}",
            mutation.id,
            mutation.kind.name(),
            mutation.entity_type,
            mutation.entity_id.as_deref().unwrap_or("-")
        );

        let timeout = Duration::from_millis(self.config.apply_timeout_ms);
        let outcome = match tokio::time::timeout(timeout, self.remote.apply(mutation)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteError::Timeout),
        };

        match outcome {
            Ok(ApplyOutcome::Applied { new_version }) => {
                self.queue.ack(&mutation.id, AckOutcome::Completed).await?;
                result.applied += 1;
                self.events
                    .emit(SyncEvent::MutationApplied {
                        mutation_id: mutation.id.clone(),
                        entity_type: mutation.entity_type.clone(),
                        entity_id: mutation.entity_id.clone(),
                        new_version,
                        timestamp: self.clock.now_ms(),
                    })
                    .await;
                Ok(Step::Continue)
            }
            Ok(ApplyOutcome::Conflict {
                remote_snapshot,
                remote_metadata,
            }) => {
                self.handle_conflict(mutation, remote_snapshot, remote_metadata, rebased, result)
                    .await
            }
            Err(RemoteError::AuthExpired) => {
                warn!("认证过期，暂停变更 {}", mutation.id);
                self.queue.ack(&mutation.id, AckOutcome::Deferred).await?;
                result.deferred += 1;
                result.auth_expired = true;
                Ok(Step::Block)
            }
            Err(e) => self.handle_failure(mutation, e, result).await,
        }
    }

    async fn handle_failure(
        &self,
        mutation: &QueuedMutation,
        error: RemoteError,
        result: &mut GroupResult,
    ) -> Result<Step> {
        let reason = FailureReason::from(&error);
        let message = error.to_string();

        let ack = if reason.is_retryable() {
            AckOutcome::RetryableFailure {
                error: message.clone(),
                reason,
            }
        } else {
            AckOutcome::PermanentFailure {
                error: message.clone(),
                reason: Some(reason),
            }
        };

        match self.queue.ack(&mutation.id, ack).await? {
            AckResult::RetryScheduled {
                retry_count,
                not_before,
            } => {
                info!(
                    "变更 {} 将在 {} 后重试 (retry_count={}): {}",
                    mutation.id,
                    format_duration_ms(not_before - self.clock.now_ms()),
                    retry_count,
                    message
                );
                result.retried += 1;
                self.events
                    .emit(SyncEvent::MutationRetryScheduled {
                        mutation_id: mutation.id.clone(),
                        retry_count,
                        not_before,
                        error: message,
                        timestamp: self.clock.now_ms(),
                    })
                    .await;
                Ok(Step::Block)
            }
            _ => {
                warn!("❌ 变更 {} 失败: {}", mutation.id, message);
                self.status.record_error(message.clone());
                result.failed += 1;
                self.events
                    .emit(SyncEvent::MutationFailed {
                        mutation_id: mutation.id.clone(),
                        entity_type: mutation.entity_type.clone(),
                        entity_id: mutation.entity_id.clone(),
                        error: message,
                        optimistic: mutation.optimistic,
                        previous_payload: mutation.previous_payload.clone(),
                        timestamp: self.clock.now_ms(),
                    })
                    .await;
                // 终态失败不阻塞同实体的后续变更
                Ok(Step::Continue)
            }
        }
    }

    async fn handle_conflict(
        &self,
        mutation: &QueuedMutation,
        remote_snapshot: Option<serde_json::Value>,
        remote_metadata: ChangeMetadata,
        rebased: &HashSet<MutationId>,
        result: &mut GroupResult,
    ) -> Result<Step> {
        let now = self.clock.now_ms();
        let remote_version = remote_metadata.version;
        let local_metadata = self.local_metadata(mutation);

        let sides = ConflictSides::from_mutation(
            mutation,
            local_metadata,
            remote_snapshot.clone(),
            remote_metadata,
        );
        let Some(conflict) = self.detector.detect(mutation, sides, now) else {
            if mutation.local_snapshot() == remote_snapshot {
                debug!("远端已是本地期望的状态: {}", mutation.id);
                self.queue.ack(&mutation.id, AckOutcome::Completed).await?;
                result.applied += 1;
                return Ok(Step::Continue);
            }
            if rebased.contains(&mutation.id) {
                self.queue.ack(&mutation.id, AckOutcome::Deferred).await?;
                result.deferred += 1;
                result.stalled = true;
                return Ok(Step::Block);
            }
            debug!("变更 {} rebase 到远端版本 {}", mutation.id, remote_version);
            self.queue
                .ack(
                    &mutation.id,
                    AckOutcome::Rebase {
                        base_version: remote_version,
                    },
                )
                .await?;
            result.rebased.push(mutation.id.clone());
            return Ok(Step::Block);
        };

        let conflict = self.resolver.record(conflict).await?;
        self.queue
            .ack(
                &mutation.id,
                AckOutcome::Conflict {
                    conflict_id: conflict.id.to_string(),
                },
            )
            .await?;
        result.conflicts_detected += 1;

        match self.resolver.try_auto_resolve(&conflict.id).await {
            Ok(Resolution::Resolved { .. }) => result.conflicts_resolved += 1,
            Ok(Resolution::PendingManual { .. }) => {}
            Err(e) => {
                warn!("冲突 {} 自动解决失败: {}", conflict.id, e);
                self.status.record_error(e.to_string());
            }
        }
        Ok(Step::Block)
    }

    fn local_metadata(&self, mutation: &QueuedMutation) -> ChangeMetadata {
        ChangeMetadata {
            user_id: mutation.user_id.clone(),
            display_name: None,
            timestamp: mutation.created_at,
            device_id: self.config.device_id.clone(),
            version: mutation.base_version.unwrap_or(0),
        }
    }

    async fn finish(&self, mut report: CycleReport, fatal: Option<String>) -> CycleReport {
        let now = self.clock.now_ms();
        report.finished_at = now;

        let stats = self.queue.stats().await;
        let unresolved = self.resolver.unresolved_count().await;
        self.status
            .set_counts(stats.pending + stats.in_progress, unresolved);

        let state = if unresolved > 0 {
            report.outcome = CycleOutcome::Conflicts;
            SyncState::Conflicts
        } else if let Some(error) = fatal {
            self.status.record_error(error.clone());
            report.outcome = CycleOutcome::Failed(error);
            if report.processed() == 0 {
                SyncState::Failed
            } else {
                SyncState::Idle
            }
        } else {
            report.outcome = CycleOutcome::Synced;
            self.status.record_success(now);
            SyncState::Synced
        };

        self.status.set_state(state).await;
        if state == SyncState::Synced {
            self.status.set_state(SyncState::Idle).await;
        }
        self.status.set_phase(CoordinatorPhase::Idle);

        info!(
            "✅ drain 周期结束: outcome={:?}, applied={}, retried={}, failed={}, conflicts={}/{}, deferred={}, 耗时 {}",
            report.outcome,
            report.applied,
            report.retried,
            report.failed,
            report.conflicts_resolved,
            report.conflicts_detected,
            report.deferred,
            format_duration_ms(now - report.started_at)
        );

        self.events
            .emit(SyncEvent::CycleCompleted {
                report: report.clone(),
                timestamp: now,
            })
            .await;
        report
    }
}

/// 按实体分组，保持出队顺序
fn group_by_entity(batch: Vec<QueuedMutation>) -> Vec<Vec<QueuedMutation>> {
    let mut index: HashMap<EntityKey, usize> = HashMap::new();
    let mut groups: Vec<Vec<QueuedMutation>> = Vec::new();
    for mutation in batch {
        let key = mutation.entity_key();
        match index.get(&key) {
            Some(&i) => groups[i].push(mutation),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![mutation]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests;
