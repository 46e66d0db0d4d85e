//! 冲突解决引擎
//!
//! 策略：
//! - LastWriteWins：时间戳较新的一方整体胜出，时钟误差范围内远端胜出
//! - FieldMerge：逐字段合并，双方都修改且不同的字段按字段规则处理，
//!   没有规则时整个冲突升级为人工处理
//! - Manual：等待 [`ResolutionEngine::resolve_manual`]
//! - Custom：调用注入的 [`CustomResolver`]
//!
//! 解决完成后的步骤顺序（崩溃后可按日志重放）：
//! 写日志 → 重新入队解决后的变更 → 删除原变更 → 删除冲突记录

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::conflict::detector::{ConflictDetector, FieldComparator};
use crate::conflict::log::ConflictLog;
use crate::conflict::{
    Conflict, ConflictId, ConflictLogEntry, FieldChange, ResolutionOutcome, ResolutionStrategy,
};
use crate::error::{Result, SyncError};
use crate::events::{EventManager, SyncEvent};
use crate::queue::{AckOutcome, MutationKind, MutationStatus, OfflineQueue, QueuedMutation};
use crate::storage::{QueueStore, RecordKey, StoreRecord};
use crate::utils::Clock;

/// 双方都修改且不同的字段的合并规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldMergeRule {
    /// 取数值较大的一方（如数量）
    TakeLarger,
    TakeSmaller,
    /// 字段级的最后写入胜出
    LastWriteWins,
    PreferLocal,
    PreferRemote,
    /// 数组取并集，远端元素在前
    UnionArrays,
}

/// 冲突解决配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// 默认策略
    pub default_strategy: ResolutionStrategy,
    /// 按实体类型覆盖默认策略
    pub entity_strategies: HashMap<String, ResolutionStrategy>,
    /// 字段合并规则
    pub field_rules: HashMap<String, FieldMergeRule>,
    /// 字段比较器，未配置的字段精确比较
    pub field_comparators: HashMap<String, FieldComparator>,
    /// 不参与比较的字段
    pub ignored_fields: Vec<String>,
    /// LastWriteWins 允许的时钟误差（毫秒），必须显式配置
    pub clock_skew_tolerance_ms: Option<u64>,
    /// 自动解决时记录的解决者
    pub resolver_id: String,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            default_strategy: ResolutionStrategy::FieldMerge,
            entity_strategies: HashMap::new(),
            field_rules: HashMap::new(),
            field_comparators: HashMap::new(),
            ignored_fields: Vec::new(),
            clock_skew_tolerance_ms: None,
            resolver_id: "system".to_string(),
        }
    }
}

impl ResolutionConfig {
    pub fn with_field_rule(mut self, field: impl Into<String>, rule: FieldMergeRule) -> Self {
        self.field_rules.insert(field.into(), rule);
        self
    }

    pub fn with_entity_strategy(
        mut self,
        entity_type: impl Into<String>,
        strategy: ResolutionStrategy,
    ) -> Self {
        self.entity_strategies.insert(entity_type.into(), strategy);
        self
    }

    pub fn with_clock_skew_tolerance_ms(mut self, tolerance_ms: u64) -> Self {
        self.clock_skew_tolerance_ms = Some(tolerance_ms);
        self
    }

    /// 按配置构造检测器
    pub fn detector(&self) -> ConflictDetector {
        let detector = self
            .field_comparators
            .iter()
            .fold(ConflictDetector::new(), |detector, (field, comparator)| {
                detector.with_comparator(field.clone(), comparator.clone())
            });
        self.ignored_fields
            .iter()
            .fold(detector, |detector, field| detector.ignore_field(field.clone()))
    }

    fn skew_tolerance(&self) -> Result<i64> {
        let tolerance = self.clock_skew_tolerance_ms.ok_or_else(|| {
            SyncError::Config("clock_skew_tolerance_ms must be configured".to_string())
        })?;
        Ok(i64::try_from(tolerance).unwrap_or(i64::MAX))
    }
}

/// 单个冲突的解决结果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved {
        /// None 表示解决结果是删除实体
        snapshot: Option<Value>,
        outcome: ResolutionOutcome,
        field_changes: Vec<FieldChange>,
    },
    /// 需要用户选择
    PendingManual {
        conflict_id: ConflictId,
        unresolved_fields: Vec<String>,
    },
}

/// 用户的人工选择
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManualChoice {
    Local,
    Remote,
    /// 用户提供的快照，None 表示删除
    Custom(Option<Value>),
    /// 放弃本地变更
    Skip,
}

/// 人工解决请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionAction {
    pub conflict_id: ConflictId,
    pub choice: ManualChoice,
    pub resolved_by: String,
}

impl ResolutionAction {
    pub fn new(conflict_id: ConflictId, choice: ManualChoice, resolved_by: impl Into<String>) -> Self {
        Self {
            conflict_id,
            choice,
            resolved_by: resolved_by.into(),
        }
    }
}

/// 应用注入的自定义解决钩子
#[async_trait]
pub trait CustomResolver: Send + Sync {
    /// 返回解决后的快照（None 表示删除）；返回 Err 时冲突保持未解决
    async fn resolve(&self, conflict: &Conflict) -> std::result::Result<Option<Value>, String>;
}

/// 冲突解决引擎
pub struct ResolutionEngine {
    config: ResolutionConfig,
    skew_tolerance_ms: i64,
    store: Arc<dyn QueueStore>,
    queue: Arc<OfflineQueue>,
    log: Arc<ConflictLog>,
    custom: Option<Arc<dyn CustomResolver>>,
    events: Arc<EventManager>,
    clock: Arc<dyn Clock>,
    /// 未解决的冲突；持有锁完成整个解决流程
    conflicts: Mutex<BTreeMap<ConflictId, Conflict>>,
}

impl std::fmt::Debug for ResolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionEngine")
            .field("default_strategy", &self.config.default_strategy)
            .field("skew_tolerance_ms", &self.skew_tolerance_ms)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl ResolutionEngine {
    /// 创建引擎并恢复持久化的冲突
    ///
    /// 已有日志的冲突说明上次在解决途中崩溃，补完剩余步骤；
    /// 原变更尚未进入 Conflict 状态的冲突会在重新投递时再次检测，直接丢弃。
    pub async fn open(
        config: ResolutionConfig,
        store: Arc<dyn QueueStore>,
        queue: Arc<OfflineQueue>,
        log: Arc<ConflictLog>,
        custom: Option<Arc<dyn CustomResolver>>,
        events: Arc<EventManager>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let skew_tolerance_ms = config.skew_tolerance()?;
        let engine = Self {
            config,
            skew_tolerance_ms,
            store,
            queue,
            log,
            custom,
            events,
            clock,
            conflicts: Mutex::new(BTreeMap::new()),
        };
        engine.reconcile().await?;
        Ok(engine)
    }

    async fn reconcile(&self) -> Result<()> {
        let mut conflicts = self.conflicts.lock().await;
        for record in self.store.list_all().await? {
            let StoreRecord::Conflict(conflict) = record else {
                continue;
            };

            if let Some(entry) = self.log.find(&conflict.id).await {
                info!("补完中断的冲突解决: {}", conflict.id);
                self.complete(&conflict, &entry).await?;
                continue;
            }

            match self.queue.get(&conflict.mutation_id).await {
                Some(mutation) if mutation.status != MutationStatus::Conflict => {
                    debug!("原变更 {} 将重新投递，丢弃冲突记录 {}", mutation.id, conflict.id);
                    self.store
                        .delete(&RecordKey::Conflict(conflict.id.clone()))
                        .await?;
                }
                _ => {
                    conflicts.insert(conflict.id.clone(), conflict);
                }
            }
        }

        if !conflicts.is_empty() {
            info!("恢复 {} 个未解决的冲突", conflicts.len());
        }
        Ok(())
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    /// 实体类型对应的策略
    pub fn strategy_for(&self, entity_type: &str) -> ResolutionStrategy {
        self.config
            .entity_strategies
            .get(entity_type)
            .copied()
            .unwrap_or(self.config.default_strategy)
    }

    /// 记录新检测到的冲突（持久化后才会确认原变更为 Conflict）
    pub async fn record(&self, mut conflict: Conflict) -> Result<Conflict> {
        conflict.strategy = Some(self.strategy_for(&conflict.entity_type));

        let mut conflicts = self.conflicts.lock().await;
        self.store.put(&StoreRecord::Conflict(conflict.clone())).await?;
        conflicts.insert(conflict.id.clone(), conflict.clone());
        drop(conflicts);

        info!(
            "冲突已记录: id={}, type={}, entity={}/{}, strategy={:?}",
            conflict.id,
            conflict.conflict_type,
            conflict.entity_type,
            conflict.entity_id.as_deref().unwrap_or("-"),
            conflict.strategy
        );
        self.events
            .emit(SyncEvent::ConflictDetected {
                conflict_id: conflict.id.clone(),
                mutation_id: conflict.mutation_id.clone(),
                entity_type: conflict.entity_type.clone(),
                entity_id: conflict.entity_id.clone(),
                conflict_type: conflict.conflict_type,
                timestamp: self.clock.now_ms(),
            })
            .await;
        Ok(conflict)
    }

    /// 按冲突记录的策略尝试自动解决
    ///
    /// 返回 PendingManual 时冲突保持未解决；Custom 钩子失败返回 `ResolutionRejected`
    pub async fn try_auto_resolve(&self, conflict_id: &ConflictId) -> Result<Resolution> {
        let mut conflicts = self.conflicts.lock().await;
        let conflict = conflicts
            .get(conflict_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", conflict_id)))?;
        let strategy = conflict
            .strategy
            .unwrap_or_else(|| self.strategy_for(&conflict.entity_type));

        let resolution = self.resolve(&conflict, strategy).await?;
        match &resolution {
            Resolution::Resolved {
                snapshot,
                outcome,
                field_changes,
            } => {
                let mut conflict = conflict;
                conflict.field_changes = field_changes.clone();
                let resolved_by = self.config.resolver_id.clone();
                self.finalize(
                    &mut conflicts,
                    conflict,
                    strategy,
                    snapshot.clone(),
                    *outcome,
                    &resolved_by,
                    true,
                )
                .await?;
            }
            Resolution::PendingManual {
                unresolved_fields, ..
            } => {
                info!(
                    "冲突 {} 需要人工处理，未解决字段: {:?}",
                    conflict_id, unresolved_fields
                );
            }
        }
        Ok(resolution)
    }

    /// 按指定策略计算解决结果，不修改任何状态
    pub async fn resolve(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution> {
        match strategy {
            ResolutionStrategy::LastWriteWins => Ok(self.last_write_wins(conflict)),
            ResolutionStrategy::FieldMerge => Ok(self.field_merge(conflict)),
            ResolutionStrategy::Manual => Ok(Resolution::PendingManual {
                conflict_id: conflict.id.clone(),
                unresolved_fields: conflict
                    .conflicting_fields()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            }),
            ResolutionStrategy::Custom => {
                let hook = self.custom.as_ref().ok_or_else(|| {
                    SyncError::ResolutionRejected(format!(
                        "no custom resolver registered for conflict {}",
                        conflict.id
                    ))
                })?;
                match hook.resolve(conflict).await {
                    Ok(snapshot) => Ok(Resolution::Resolved {
                        snapshot,
                        outcome: ResolutionOutcome::Custom,
                        field_changes: conflict.field_changes.clone(),
                    }),
                    Err(reason) => {
                        warn!("自定义解决钩子拒绝冲突 {}: {}", conflict.id, reason);
                        Err(SyncError::ResolutionRejected(reason))
                    }
                }
            }
        }
    }

    /// 本地时间戳超出远端加误差时本地胜出，否则远端胜出
    fn local_wins(&self, conflict: &Conflict) -> bool {
        conflict.local_metadata.timestamp
            > conflict
                .remote_metadata
                .timestamp
                .saturating_add(self.skew_tolerance_ms)
    }

    fn last_write_wins(&self, conflict: &Conflict) -> Resolution {
        let (snapshot, outcome) = if self.local_wins(conflict) {
            (conflict.local.clone(), ResolutionOutcome::LocalAccepted)
        } else {
            (conflict.remote.clone(), ResolutionOutcome::RemoteAccepted)
        };
        Resolution::Resolved {
            snapshot,
            outcome,
            field_changes: conflict.field_changes.clone(),
        }
    }

    fn field_merge(&self, conflict: &Conflict) -> Resolution {
        let (Some(Value::Object(_)), Some(Value::Object(remote))) = (&conflict.local, &conflict.remote)
        else {
            // 删除与修改无法逐字段合并
            return Resolution::PendingManual {
                conflict_id: conflict.id.clone(),
                unresolved_fields: vec![conflict.conflict_type.name().to_string()],
            };
        };

        let mut merged = remote.clone();
        let mut field_changes = conflict.field_changes.clone();
        let mut unresolved_fields = Vec::new();

        for change in field_changes.iter_mut() {
            let value = if !change.local_changed {
                Some(change.remote.clone())
            } else if !change.remote_changed || !change.has_conflict {
                // 只有本地修改，或双方改成了相同的值
                if change.remote_changed {
                    Some(change.remote.clone())
                } else {
                    Some(change.local.clone())
                }
            } else {
                self.config
                    .field_rules
                    .get(&change.field)
                    .and_then(|rule| self.apply_rule(*rule, change, conflict))
            };

            match value {
                Some(value) => {
                    match &value {
                        Some(v) => {
                            merged.insert(change.field.clone(), v.clone());
                        }
                        None => {
                            merged.remove(&change.field);
                        }
                    }
                    change.resolved = Some(value);
                }
                None => unresolved_fields.push(change.field.clone()),
            }
        }

        if !unresolved_fields.is_empty() {
            return Resolution::PendingManual {
                conflict_id: conflict.id.clone(),
                unresolved_fields,
            };
        }

        Resolution::Resolved {
            snapshot: Some(Value::Object(merged)),
            outcome: ResolutionOutcome::Merged,
            field_changes,
        }
    }

    /// 返回 None 表示规则不适用于该字段的值
    fn apply_rule(
        &self,
        rule: FieldMergeRule,
        change: &FieldChange,
        conflict: &Conflict,
    ) -> Option<Option<Value>> {
        let local = change.local.as_ref();
        let remote = change.remote.as_ref();
        match rule {
            FieldMergeRule::TakeLarger | FieldMergeRule::TakeSmaller => {
                let l = local.and_then(Value::as_f64)?;
                let r = remote.and_then(Value::as_f64)?;
                let take_local = match rule {
                    FieldMergeRule::TakeLarger => l > r,
                    _ => l < r,
                };
                Some(if take_local {
                    change.local.clone()
                } else {
                    change.remote.clone()
                })
            }
            FieldMergeRule::LastWriteWins => Some(if self.local_wins(conflict) {
                change.local.clone()
            } else {
                change.remote.clone()
            }),
            FieldMergeRule::PreferLocal => Some(change.local.clone()),
            FieldMergeRule::PreferRemote => Some(change.remote.clone()),
            FieldMergeRule::UnionArrays => {
                let local_items = local.and_then(Value::as_array)?;
                let mut union = remote.and_then(Value::as_array)?.clone();
                for item in local_items {
                    if !union.contains(item) {
                        union.push(item.clone());
                    }
                }
                Some(Some(Value::Array(union)))
            }
        }
    }

    /// 人工解决
    pub async fn resolve_manual(&self, action: ResolutionAction) -> Result<ConflictLogEntry> {
        let mut conflicts = self.conflicts.lock().await;
        let conflict = conflicts
            .get(&action.conflict_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("conflict {}", action.conflict_id)))?;

        let (snapshot, outcome) = match action.choice {
            ManualChoice::Local => (conflict.local.clone(), ResolutionOutcome::LocalAccepted),
            ManualChoice::Remote => (conflict.remote.clone(), ResolutionOutcome::RemoteAccepted),
            ManualChoice::Custom(snapshot) => (snapshot, ResolutionOutcome::Custom),
            ManualChoice::Skip => (conflict.remote.clone(), ResolutionOutcome::Skipped),
        };

        self.finalize(
            &mut conflicts,
            conflict,
            ResolutionStrategy::Manual,
            snapshot,
            outcome,
            &action.resolved_by,
            false,
        )
        .await
    }

    /// 批量人工解决，逐个返回结果
    pub async fn resolve_batch(
        &self,
        actions: Vec<ResolutionAction>,
    ) -> Vec<Result<ConflictLogEntry>> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            results.push(self.resolve_manual(action).await);
        }
        results
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        conflicts: &mut BTreeMap<ConflictId, Conflict>,
        mut conflict: Conflict,
        strategy: ResolutionStrategy,
        snapshot: Option<Value>,
        outcome: ResolutionOutcome,
        resolved_by: &str,
        automatic: bool,
    ) -> Result<ConflictLogEntry> {
        let now = self.clock.now_ms();

        // 上次在日志写入之后失败：沿用已记录的结果，只补完剩余步骤
        let entry = match self.log.find(&conflict.id).await {
            Some(existing) => {
                warn!("冲突 {} 已有解决日志，补完剩余步骤", conflict.id);
                existing
            }
            None => {
                let entry = ConflictLogEntry {
                    id: conflict.id.to_string(),
                    conflict_id: conflict.id.clone(),
                    mutation_id: conflict.mutation_id.clone(),
                    entity_type: conflict.entity_type.clone(),
                    entity_id: conflict.entity_id.clone(),
                    conflict_type: conflict.conflict_type,
                    strategy,
                    outcome,
                    resolved_by: resolved_by.to_string(),
                    resolved_at: now,
                    automatic,
                    local: conflict.local.clone(),
                    remote: conflict.remote.clone(),
                    resolved: snapshot,
                };
                self.log.append(entry.clone()).await?;
                entry
            }
        };

        conflict.resolved = true;
        conflict.resolved_snapshot = entry.resolved.clone();
        conflict.resolved_by = Some(entry.resolved_by.clone());
        conflict.resolved_at = Some(entry.resolved_at);

        self.complete(&conflict, &entry).await?;
        conflicts.remove(&conflict.id);

        info!(
            "冲突已解决: id={}, outcome={:?}, automatic={}, by={}",
            conflict.id, entry.outcome, entry.automatic, entry.resolved_by
        );
        self.events
            .emit(SyncEvent::ConflictResolved {
                conflict_id: conflict.id.clone(),
                outcome: entry.outcome,
                automatic: entry.automatic,
                timestamp: now,
            })
            .await;
        Ok(entry)
    }

    /// 日志写入之后的步骤，均可重复执行
    ///
    /// 需要重新应用的结果原地替换 Conflict 状态的原变更，
    /// 否则原变更直接以 Resolved 确认删除
    async fn complete(&self, conflict: &Conflict, entry: &ConflictLogEntry) -> Result<()> {
        let original = self.queue.get(&conflict.mutation_id).await;

        if entry.outcome.keeps_remote() {
            if let Some(original) = original {
                if original.status == MutationStatus::Conflict {
                    self.queue.ack(&original.id, AckOutcome::Resolved).await?;
                }
            }
        } else {
            let resolved = Self::resolved_mutation(conflict, original.as_ref(), entry.resolved.clone());
            self.queue
                .enqueue_replacing(&conflict.mutation_id, resolved)
                .await?;
        }

        self.store
            .delete(&RecordKey::Conflict(conflict.id.clone()))
            .await
    }

    /// 携带解决结果的新变更，以远端当前版本为基线，继承原变更的排序位置
    fn resolved_mutation(
        conflict: &Conflict,
        original: Option<&QueuedMutation>,
        snapshot: Option<Value>,
    ) -> QueuedMutation {
        let kind = match (&snapshot, &conflict.remote, &conflict.entity_id) {
            (None, _, _) => MutationKind::Delete,
            (Some(_), None, _) | (Some(_), _, None) => MutationKind::Create,
            (Some(_), Some(_), Some(_)) => MutationKind::Update,
        };

        let user_id = original
            .map(|m| m.user_id.clone())
            .unwrap_or_else(|| conflict.local_metadata.user_id.clone());
        let mut mutation = QueuedMutation::new(
            kind,
            conflict.entity_type.clone(),
            conflict.entity_id.clone(),
            snapshot.unwrap_or(Value::Null),
            user_id,
        )
        .with_id(conflict.id.resolved_mutation_id())
        .with_created_at(conflict.local_metadata.timestamp);

        mutation.previous_payload = conflict.remote.clone();
        mutation.base_version = Some(conflict.remote_metadata.version);

        if let Some(original) = original {
            mutation.created_at = original.created_at;
            mutation.sequence = original.sequence;
            mutation.priority = original.priority;
            mutation.optimistic = original.optimistic;
        }
        mutation
    }

    /// 未解决的冲突，按检测时间排序
    pub async fn unresolved(&self) -> Vec<Conflict> {
        let mut list: Vec<Conflict> = self.conflicts.lock().await.values().cloned().collect();
        list.sort_by_key(|c| c.detected_at);
        list
    }

    pub async fn unresolved_count(&self) -> usize {
        self.conflicts.lock().await.len()
    }

    pub async fn get(&self, conflict_id: &ConflictId) -> Option<Conflict> {
        self.conflicts.lock().await.get(conflict_id).cloned()
    }

    pub fn log(&self) -> &Arc<ConflictLog> {
        &self.log
    }
}
