//! 离线变更队列
//!
//! 所有队列状态的修改只经过 [`OfflineQueue::enqueue`] 和 [`OfflineQueue::ack`]
//! （以及 drain 使用的出队/处理锁），每次状态迁移在返回前同步写入
//! [`QueueStore`]，进程在任意位置崩溃后都能恢复到一致的队列。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::storage::{ProcessingLock, QueueStore, RecordKey, StoreRecord};
use crate::utils::Clock;

pub mod mutation;
pub mod priority;
pub mod retry_policy;

pub use mutation::{EntityKey, MutationId, MutationKind, MutationStatus, QueuedMutation};
pub use priority::MutationPriority;
pub use retry_policy::{FailureReason, RetryPolicy};

/// 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 最大队列长度
    pub max_queue_size: usize,
    /// 每次出队的最大数量
    pub batch_size: usize,
    /// 保留的 Completed 记录数量，0 表示确认后立即删除
    pub completed_history_limit: usize,
    /// 处理锁的陈旧窗口（毫秒）
    pub lock_staleness_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 500,
            batch_size: 10,
            completed_history_limit: 0,
            lock_staleness_ms: 10 * 60 * 1000,
        }
    }
}

/// 确认结果类型
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// 远端已应用
    Completed,
    /// 可重试的失败（网络、超时、限流）
    RetryableFailure { error: String, reason: FailureReason },
    /// 终态失败（服务端校验拒绝等）
    PermanentFailure {
        error: String,
        reason: Option<FailureReason>,
    },
    /// 与远端冲突，进入冲突流程
    Conflict { conflict_id: String },
    /// 已出队但未尝试（取消、超时、认证暂停），放回 Pending
    Deferred,
    /// 远端版本前移但未构成冲突，更新基线版本后放回 Pending
    Rebase { base_version: u64 },
    /// 冲突已解决，删除原记录
    Resolved,
}

/// ack 之后记录的去向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResult {
    /// 记录已从队列删除
    Removed,
    /// 记录以 Completed 状态保留在历史中
    Completed,
    RetryScheduled { retry_count: u32, not_before: i64 },
    Failed { retry_count: u32 },
    Conflict,
    Released,
}

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub conflict: usize,
    pub processing: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    mutations: HashMap<MutationId, QueuedMutation>,
    next_sequence: u64,
    lock: Option<ProcessingLock>,
}

impl QueueState {
    fn sorted(&self) -> Vec<&QueuedMutation> {
        let mut all: Vec<&QueuedMutation> = self.mutations.values().collect();
        all.sort_by_key(|m| m.order_key());
        all
    }

    fn dependency_satisfied(&self, id: &MutationId) -> bool {
        match self.mutations.get(id) {
            None => true,
            Some(dep) => dep.status == MutationStatus::Completed,
        }
    }

    /// 最早的一条指定状态的记录（用于淘汰）
    fn oldest_with_status(&self, status: MutationStatus) -> Option<MutationId> {
        self.mutations
            .values()
            .filter(|m| m.status == status)
            .min_by_key(|m| m.order_key())
            .map(|m| m.id.clone())
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.mutations.len(),
            processing: self.lock.is_some(),
            ..QueueStats::default()
        };
        for mutation in self.mutations.values() {
            match mutation.status {
                MutationStatus::Pending => stats.pending += 1,
                MutationStatus::InProgress => stats.in_progress += 1,
                MutationStatus::Completed => stats.completed += 1,
                MutationStatus::Failed => stats.failed += 1,
                MutationStatus::Conflict => stats.conflict += 1,
            }
        }
        stats
    }
}

/// 离线变更队列
#[derive(Debug)]
pub struct OfflineQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl OfflineQueue {
    /// 从持久化存储恢复队列
    ///
    /// - InProgress 的记录来自崩溃的 drain 周期，恢复为 Pending（至少一次投递）
    /// - 超过陈旧窗口的处理锁被清除
    pub async fn open(
        store: Arc<dyn QueueStore>,
        config: QueueConfig,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let now = clock.now_ms();
        let mut state = QueueState {
            next_sequence: 1,
            ..QueueState::default()
        };

        for record in store.list_all().await? {
            match record {
                StoreRecord::Mutation(mut mutation) => {
                    if mutation.status == MutationStatus::InProgress {
                        warn!("恢复中断的变更 {} 为 Pending", mutation.id);
                        mutation.release();
                        store.put(&StoreRecord::Mutation(mutation.clone())).await?;
                    }
                    state.next_sequence = state.next_sequence.max(mutation.sequence + 1);
                    state.mutations.insert(mutation.id.clone(), mutation);
                }
                StoreRecord::ProcessingLock(lock) => {
                    if lock.is_stale(now, config.lock_staleness_ms) {
                        warn!("清除陈旧的处理锁: owner={}, acquired_at={}", lock.owner, lock.acquired_at);
                        store.delete(&RecordKey::ProcessingLock).await?;
                    } else {
                        state.lock = Some(lock);
                    }
                }
                StoreRecord::Conflict(_) | StoreRecord::LogEntry(_) => {}
            }
        }

        info!(
            "离线队列已加载: {} 条记录, processing={}",
            state.mutations.len(),
            state.lock.is_some()
        );

        Ok(Self {
            store,
            config,
            retry_policy,
            clock,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// 入队
    ///
    /// 重复的 ID 不会产生新记录，直接返回已有记录。队列满时依次淘汰
    /// 最早的 Completed、最早的 Failed 记录，都没有则返回 `QueueFull`。
    pub async fn enqueue(&self, mutation: QueuedMutation) -> Result<QueuedMutation> {
        Self::validate(&mutation)?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.mutations.get(&mutation.id) {
            debug!("重复入队，返回已有记录: {}", mutation.id);
            return Ok(existing.clone());
        }

        self.make_room(&mut state, &mutation.id).await?;
        self.admit(&mut state, mutation).await
    }

    /// 用冲突解决的结果替换处于 Conflict 状态的原变更
    ///
    /// 新记录占用原变更的位置，不受队列容量限制；依赖原变更的记录改为
    /// 依赖新记录，保证它们不会在解决结果应用之前出队。可重复执行：
    /// 新记录已存在时只补完依赖改写和原记录删除。
    pub(crate) async fn enqueue_replacing(
        &self,
        original_id: &MutationId,
        mutation: QueuedMutation,
    ) -> Result<QueuedMutation> {
        Self::validate(&mutation)?;
        let mut state = self.state.lock().await;

        let replaces = state
            .mutations
            .get(original_id)
            .is_some_and(|original| original.status == MutationStatus::Conflict);

        let mutation = match state.mutations.get(&mutation.id) {
            Some(existing) => existing.clone(),
            None => {
                if !replaces {
                    self.make_room(&mut state, &mutation.id).await?;
                }
                self.admit(&mut state, mutation).await?
            }
        };

        self.redirect_dependencies(&mut state, original_id, &mutation.id)
            .await?;

        if replaces {
            self.store
                .delete(&RecordKey::Mutation(original_id.clone()))
                .await?;
            state.mutations.remove(original_id);
            info!("冲突变更 {} 已被 {} 替换", original_id, mutation.id);
        }
        Ok(mutation)
    }

    fn validate(mutation: &QueuedMutation) -> Result<()> {
        if mutation.entity_type.trim().is_empty() {
            return Err(SyncError::InvalidInput("entity_type must not be empty".to_string()));
        }
        if matches!(mutation.kind, MutationKind::Update | MutationKind::Delete)
            && mutation.entity_id.is_none()
        {
            return Err(SyncError::InvalidInput(format!(
                "{} mutation requires an entity_id",
                mutation.kind.name()
            )));
        }
        Ok(())
    }

    /// 队列满时依次淘汰最早的 Completed、Failed 记录
    async fn make_room(&self, state: &mut QueueState, incoming: &MutationId) -> Result<()> {
        while state.mutations.len() >= self.config.max_queue_size {
            let victim = state
                .oldest_with_status(MutationStatus::Completed)
                .or_else(|| state.oldest_with_status(MutationStatus::Failed));
            match victim {
                Some(victim) => {
                    self.store.delete(&RecordKey::Mutation(victim.clone())).await?;
                    state.mutations.remove(&victim);
                    info!("队列已满，淘汰记录: {}", victim);
                }
                None => {
                    warn!(
                        "队列已满，拒绝入队: {} ({}/{})",
                        incoming,
                        state.mutations.len(),
                        self.config.max_queue_size
                    );
                    return Err(SyncError::QueueFull {
                        size: state.mutations.len(),
                        capacity: self.config.max_queue_size,
                    });
                }
            }
        }
        Ok(())
    }

    async fn admit(&self, state: &mut QueueState, mut mutation: QueuedMutation) -> Result<QueuedMutation> {
        mutation.status = MutationStatus::Pending;
        if mutation.created_at <= 0 {
            mutation.created_at = self.clock.now_ms();
        }
        if mutation.sequence == 0 {
            mutation.sequence = state.next_sequence;
        }
        state.next_sequence = state.next_sequence.max(mutation.sequence + 1);
        if mutation.max_retries.is_none() {
            mutation.max_retries = Some(self.retry_policy.max_retries);
        }

        self.store.put(&StoreRecord::Mutation(mutation.clone())).await?;
        state.mutations.insert(mutation.id.clone(), mutation.clone());

        info!(
            "变更已入队: id={}, kind={}, entity={}/{}, priority={}",
            mutation.id,
            mutation.kind.name(),
            mutation.entity_type,
            mutation.entity_id.as_deref().unwrap_or("-"),
            mutation.priority
        );
        Ok(mutation)
    }

    async fn redirect_dependencies(
        &self,
        state: &mut QueueState,
        from: &MutationId,
        to: &MutationId,
    ) -> Result<()> {
        let dependents: Vec<MutationId> = state
            .mutations
            .values()
            .filter(|m| m.depends_on.contains(from))
            .map(|m| m.id.clone())
            .collect();

        for id in dependents {
            let Some(current) = state.mutations.get(&id) else {
                continue;
            };
            let mut dependent = current.clone();
            for dep in dependent.depends_on.iter_mut() {
                if dep == from {
                    *dep = to.clone();
                }
            }
            self.store.put(&StoreRecord::Mutation(dependent.clone())).await?;
            debug!("变更 {} 的依赖 {} 改为 {}", id, from, to);
            state.mutations.insert(id, dependent);
        }
        Ok(())
    }

    /// 批量出队
    ///
    /// 返回最多 `limit` 条可处理的 Pending 变更（依赖全部完成、退避时间已到），
    /// 按优先级降序、创建时间升序排列。同一实体的变更只有在其之前的所有
    /// 变更都已完成（或终态失败）或已在本批次中时才会被选中，因此永远不会乱序。
    /// 选中的变更被标记为 InProgress 并持久化。
    pub async fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueuedMutation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;

        let selected_ids = Self::select_batch(&state, now, limit);
        let mut batch: Vec<QueuedMutation> = Vec::with_capacity(selected_ids.len());

        for id in selected_ids {
            let Some(current) = state.mutations.get(&id) else {
                continue;
            };
            let mut mutation = current.clone();
            mutation.mark_in_progress(now);
            if let Err(e) = self.store.put(&StoreRecord::Mutation(mutation.clone())).await {
                // 已标记的记录放回 Pending，避免在内存中卡在 InProgress
                for taken in &batch {
                    if let Some(m) = state.mutations.get_mut(&taken.id) {
                        m.release();
                        if let Err(rollback) = self.store.put(&StoreRecord::Mutation(m.clone())).await {
                            warn!("回滚变更 {} 状态失败: {}", taken.id, rollback);
                        }
                    }
                }
                return Err(e);
            }
            state.mutations.insert(id, mutation.clone());
            batch.push(mutation);
        }

        if !batch.is_empty() {
            debug!("出队 {} 条变更", batch.len());
        }
        Ok(batch)
    }

    fn select_batch(state: &QueueState, now: i64, limit: usize) -> Vec<MutationId> {
        let ordered = state.sorted();

        // 每个实体按创建顺序排列、仍会被应用的记录；Failed 永远不会再应用，不阻塞后续变更
        let mut per_entity: HashMap<EntityKey, Vec<&MutationId>> = HashMap::new();
        for mutation in &ordered {
            if !matches!(
                mutation.status,
                MutationStatus::Completed | MutationStatus::Failed
            ) {
                per_entity
                    .entry(mutation.entity_key())
                    .or_default()
                    .push(&mutation.id);
            }
        }

        let mut candidates: Vec<&QueuedMutation> = ordered
            .into_iter()
            .filter(|m| m.is_ready(now))
            .filter(|m| m.depends_on.iter().all(|dep| state.dependency_satisfied(dep)))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.order_key().cmp(&b.order_key()))
        });

        let mut selected: Vec<MutationId> = Vec::new();
        let mut selected_set: HashSet<&MutationId> = HashSet::new();

        // 高优先级的后续变更可能排在同实体的前序变更之前，多轮扫描直到稳定
        loop {
            let mut progressed = false;
            for candidate in &candidates {
                if selected.len() >= limit {
                    return selected;
                }
                if selected_set.contains(&candidate.id) {
                    continue;
                }
                let predecessors_done = per_entity
                    .get(&candidate.entity_key())
                    .map(|ids| {
                        ids.iter()
                            .take_while(|id| **id != &candidate.id)
                            .all(|id| selected_set.contains(*id))
                    })
                    .unwrap_or(true);
                if predecessors_done {
                    selected.push(candidate.id.clone());
                    selected_set.insert(&candidate.id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        selected
    }

    /// 确认一条变更的处理结果
    ///
    /// 状态迁移在返回前持久化
    pub async fn ack(&self, id: &MutationId, outcome: AckOutcome) -> Result<AckResult> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;

        let mut mutation = state
            .mutations
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("mutation {}", id)))?;

        let expected = match outcome {
            AckOutcome::Resolved => MutationStatus::Conflict,
            _ => MutationStatus::InProgress,
        };
        if mutation.status != expected {
            return Err(SyncError::InvalidState(format!(
                "cannot ack {:?} for mutation {} in status {}",
                outcome, id, mutation.status
            )));
        }

        let result = match outcome {
            AckOutcome::Completed => {
                mutation.mark_completed();
                if self.config.completed_history_limit == 0 {
                    self.store.delete(&RecordKey::Mutation(id.clone())).await?;
                    state.mutations.remove(id);
                    info!("✅ 变更已完成并删除: {}", id);
                    return Ok(AckResult::Removed);
                }
                AckResult::Completed
            }
            AckOutcome::RetryableFailure { error, reason } => {
                mutation.retry_count += 1;
                let max_retries = mutation.effective_max_retries(self.retry_policy.max_retries);
                match self
                    .retry_policy
                    .next_attempt_at(now, mutation.retry_count, max_retries, &reason)
                {
                    Some(not_before) => {
                        mutation.schedule_retry(not_before, error, reason);
                        AckResult::RetryScheduled {
                            retry_count: mutation.retry_count,
                            not_before,
                        }
                    }
                    None => {
                        mutation.mark_failed(error, Some(reason));
                        AckResult::Failed {
                            retry_count: mutation.retry_count,
                        }
                    }
                }
            }
            AckOutcome::PermanentFailure { error, reason } => {
                mutation.mark_failed(error, reason);
                AckResult::Failed {
                    retry_count: mutation.retry_count,
                }
            }
            AckOutcome::Conflict { conflict_id } => {
                mutation.mark_conflict(&conflict_id);
                AckResult::Conflict
            }
            AckOutcome::Deferred => {
                mutation.release();
                AckResult::Released
            }
            AckOutcome::Rebase { base_version } => {
                mutation.base_version = Some(base_version);
                mutation.release();
                AckResult::Released
            }
            AckOutcome::Resolved => {
                self.store.delete(&RecordKey::Mutation(id.clone())).await?;
                state.mutations.remove(id);
                info!("冲突变更已解决并删除: {}", id);
                return Ok(AckResult::Removed);
            }
        };

        self.store.put(&StoreRecord::Mutation(mutation.clone())).await?;
        state.mutations.insert(id.clone(), mutation);

        if result == AckResult::Completed {
            self.trim_completed_history(&mut state).await?;
        }

        debug!("ack {} -> {:?}", id, result);
        Ok(result)
    }

    async fn trim_completed_history(&self, state: &mut QueueState) -> Result<()> {
        loop {
            let completed = state
                .mutations
                .values()
                .filter(|m| m.status == MutationStatus::Completed)
                .count();
            if completed <= self.config.completed_history_limit {
                return Ok(());
            }
            let Some(oldest) = state.oldest_with_status(MutationStatus::Completed) else {
                return Ok(());
            };
            self.store.delete(&RecordKey::Mutation(oldest.clone())).await?;
            state.mutations.remove(&oldest);
        }
    }

    /// 按处理顺序列出 Pending 变更，不改变状态
    pub async fn peek_pending(&self) -> Vec<QueuedMutation> {
        let state = self.state.lock().await;
        let mut pending: Vec<QueuedMutation> = state
            .mutations
            .values()
            .filter(|m| m.status == MutationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.order_key().cmp(&b.order_key()))
        });
        pending
    }

    pub async fn get(&self, id: &MutationId) -> Option<QueuedMutation> {
        self.state.lock().await.mutations.get(id).cloned()
    }

    /// 全部记录，按创建顺序
    pub async fn list_all(&self) -> Vec<QueuedMutation> {
        let state = self.state.lock().await;
        state.sorted().into_iter().cloned().collect()
    }

    pub async fn stats(&self) -> QueueStats {
        self.state.lock().await.stats()
    }

    /// 尚未到期的最早退避时间
    pub async fn next_retry_at(&self) -> Option<i64> {
        let now = self.clock.now_ms();
        let state = self.state.lock().await;
        state
            .mutations
            .values()
            .filter(|m| m.status == MutationStatus::Pending)
            .filter_map(|m| m.not_before)
            .filter(|&at| at > now)
            .min()
    }

    /// 尝试获取 drain 处理锁
    ///
    /// 已有未过期的锁时返回 false；锁已陈旧时接管
    pub async fn try_acquire_processing(&self, owner: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;

        if let Some(lock) = &state.lock {
            if !lock.is_stale(now, self.config.lock_staleness_ms) {
                debug!("处理锁被 {} 持有", lock.owner);
                return Ok(false);
            }
            warn!("接管陈旧的处理锁: owner={}", lock.owner);
        }

        let lock = ProcessingLock {
            owner: owner.to_string(),
            acquired_at: now,
        };
        self.store.put(&StoreRecord::ProcessingLock(lock.clone())).await?;
        state.lock = Some(lock);
        debug!("处理锁已获取: {}", owner);
        Ok(true)
    }

    /// 续期处理锁，返回锁是否仍由 `owner` 持有
    pub async fn refresh_processing(&self, owner: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().await;
        if !state.lock.as_ref().is_some_and(|lock| lock.owner == owner) {
            return Ok(false);
        }

        let lock = ProcessingLock {
            owner: owner.to_string(),
            acquired_at: now,
        };
        self.store.put(&StoreRecord::ProcessingLock(lock.clone())).await?;
        state.lock = Some(lock);
        debug!("处理锁已续期: {}", owner);
        Ok(true)
    }

    /// 释放处理锁（只有持有者可以释放）
    pub async fn release_processing(&self, owner: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match &state.lock {
            Some(lock) if lock.owner == owner => {
                self.store.delete(&RecordKey::ProcessingLock).await?;
                state.lock = None;
                debug!("处理锁已释放: {}", owner);
                Ok(())
            }
            Some(lock) => {
                warn!("处理锁已被 {} 接管，{} 不再释放", lock.owner, owner);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// 是否有未过期的处理锁
    pub async fn is_processing(&self) -> bool {
        let now = self.clock.now_ms();
        self.state
            .lock()
            .await
            .lock
            .as_ref()
            .is_some_and(|lock| !lock.is_stale(now, self.config.lock_staleness_ms))
    }
}

#[cfg(test)]
mod tests;
