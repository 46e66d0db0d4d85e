use super::*;
use crate::conflict::{FieldMergeRule, ResolutionConfig};
use crate::device::GateConfig;
use crate::queue::{MutationStatus, QueueConfig};
use crate::sync::SyncStatus;
use crate::test_support::{
    conflict_response, init_tracing, update, Harness, HarnessOptions, StaticProbe,
};
use serde_json::json;

fn manual() -> CancellationToken {
    CancellationToken::new()
}

fn network_error() -> std::result::Result<ApplyOutcome, RemoteError> {
    Err(RemoteError::Network("connection reset".to_string()))
}

fn status(h: &Harness) -> SyncStatus {
    h.status.snapshot()
}

#[tokio::test]
async fn test_drains_everything_when_remote_succeeds() {
    init_tracing();
    let h = Harness::new().await;
    for i in 0..25 {
        h.enqueue(update(&format!("item-{}", i), json!({"i": i}))).await;
    }
    let mut events = h.events.subscribe();

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;

    assert_eq!(report.outcome, CycleOutcome::Synced);
    assert_eq!(report.applied, 25);
    assert_eq!(h.queue.stats().await.total, 0);

    // Synced 之后回到 Idle
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::SyncStateChanged { new_state, .. } = event {
            states.push(new_state);
        }
    }
    assert_eq!(
        states,
        vec![SyncState::Syncing, SyncState::Synced, SyncState::Idle]
    );

    let status = status(&h);
    assert_eq!(status.sync_state, SyncState::Idle);
    assert_eq!(status.pending_changes, 0);
    assert_eq!(status.progress, 100);
    assert_eq!(status.last_successful_sync, Some(h.clock.now_ms()));
    assert_eq!(status.phase, CoordinatorPhase::Idle);
    assert!(!h.queue.is_processing().await);
}

#[tokio::test]
async fn test_same_entity_order_preserved_across_retry() {
    let h = Harness::new().await;
    let m1 = h.enqueue(update("item-1", json!({"v": 1}))).await;
    let m2 = h.enqueue(update("item-1", json!({"v": 2}))).await;
    let m3 = h.enqueue(update("item-1", json!({"v": 3}))).await;
    h.remote.script(&m1.id, network_error());

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.retried, 1);
    assert_eq!(report.deferred, 2);
    assert_eq!(report.applied, 0);
    assert_eq!(h.remote.calls(), vec![m1.id.clone()]);
    assert_eq!(h.queue.stats().await.pending, 3);

    // 退避未到期，后续变更也不能越过 m1
    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.processed(), 0);

    h.clock.advance_ms(30_000);
    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.applied, 3);
    assert_eq!(
        h.remote.calls(),
        vec![m1.id.clone(), m1.id, m2.id, m3.id]
    );
}

#[tokio::test]
async fn test_concurrent_triggers_never_double_apply() {
    let h = Harness::new().await;
    h.remote.set_delay(Duration::from_millis(20));
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(h.enqueue(update(&format!("item-{}", i), json!({}))).await.id);
    }

    let cancel = manual();
    let (a, b) = tokio::join!(
        h.coordinator.run_cycle(SyncTrigger::Manual, &cancel),
        h.coordinator
            .run_cycle(SyncTrigger::ConnectivityRestored, &cancel),
    );

    let skipped = [&a, &b].iter().filter(|r| r.is_skipped()).count();
    assert!(skipped <= 1);
    assert_eq!(a.applied + b.applied, 5);
    for id in &ids {
        assert_eq!(h.remote.call_count(id), 1, "mutation {} applied twice", id);
    }
}

#[tokio::test]
async fn test_already_running_is_skipped() {
    let h = Harness::new().await;
    h.enqueue(update("item-1", json!({}))).await;
    assert!(h.queue.try_acquire_processing("other-cycle").await.unwrap());

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.outcome, CycleOutcome::Skipped(SkipReason::AlreadyRunning));
    assert!(h.remote.calls().is_empty());
    assert_eq!(status(&h).last_skip_reason, Some(SkipReason::AlreadyRunning));
}

#[tokio::test]
async fn test_entities_dispatched_concurrently() {
    let h = Harness::new().await;
    h.remote.set_delay(Duration::from_millis(30));
    for i in 0..3 {
        h.enqueue(update(&format!("item-{}", i), json!({}))).await;
    }

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.applied, 3);
    assert_eq!(h.remote.max_in_flight(), 3);
}

#[tokio::test]
async fn test_gate_rejection_leaves_queue_untouched() {
    let h = Harness::with_options(HarnessOptions {
        probe: StaticProbe::with_battery(0.10, false),
        ..HarnessOptions::default()
    })
    .await;
    let mutation = h.enqueue(update("item-1", json!({}))).await;
    let periodic = SyncTrigger::Periodic {
        tag: "content-sync".to_string(),
    };

    let report = h.coordinator.run_cycle(periodic, &manual()).await;
    assert_eq!(report.outcome, CycleOutcome::Skipped(SkipReason::LowBattery));
    assert!(h.remote.calls().is_empty());
    assert_eq!(
        h.queue.get(&mutation.id).await.unwrap().status,
        MutationStatus::Pending
    );
    assert_eq!(status(&h).last_skip_reason, Some(SkipReason::LowBattery));
    assert_eq!(status(&h).sync_state, SyncState::Idle);

    // 手动触发不受电量限制
    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.applied, 1);
}

#[tokio::test]
async fn test_healthy_battery_proceeds_to_drain() {
    let h = Harness::with_options(HarnessOptions {
        probe: StaticProbe::with_battery(0.50, false),
        ..HarnessOptions::default()
    })
    .await;
    h.enqueue(update("item-1", json!({}))).await;

    let report = h
        .coordinator
        .run_cycle(
            SyncTrigger::Periodic {
                tag: "content-sync".to_string(),
            },
            &manual(),
        )
        .await;
    assert_eq!(report.outcome, CycleOutcome::Synced);
    assert_eq!(report.applied, 1);
}

#[tokio::test]
async fn test_periodic_floor() {
    let h = Harness::new().await;
    let periodic = || SyncTrigger::Periodic {
        tag: "content-sync".to_string(),
    };

    assert!(!h.coordinator.run_cycle(periodic(), &manual()).await.is_skipped());

    h.clock.advance_ms(60_000);
    let report = h.coordinator.run_cycle(periodic(), &manual()).await;
    assert_eq!(
        report.outcome,
        CycleOutcome::Skipped(SkipReason::Other("periodic interval floor".to_string()))
    );

    // 其他调度源不受周期下限影响
    assert!(!h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await.is_skipped());

    h.clock.advance_ms(12 * 60 * 60 * 1000);
    assert!(!h.coordinator.run_cycle(periodic(), &manual()).await.is_skipped());
}

#[tokio::test]
async fn test_cancelled_before_start_does_not_dequeue() {
    let h = Harness::new().await;
    h.enqueue(update("item-1", json!({}))).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &cancel).await;

    assert!(report.cancelled);
    assert!(h.remote.calls().is_empty());
    assert_eq!(h.queue.stats().await.pending, 1);
    assert!(!h.queue.is_processing().await);
}

/// 第一次应用时请求取消，调用本身仍然成功返回
struct CancellingRemote {
    inner: Arc<crate::test_support::ScriptedRemote>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl RemoteApply for CancellingRemote {
    async fn apply(&self, mutation: &QueuedMutation) -> std::result::Result<ApplyOutcome, RemoteError> {
        self.cancel.cancel();
        self.inner.apply(mutation).await
    }
}

#[tokio::test]
async fn test_cancellation_lets_in_flight_call_finish() {
    let h = Harness::with_options(HarnessOptions {
        queue: QueueConfig {
            batch_size: 1,
            ..QueueConfig::default()
        },
        ..HarnessOptions::default()
    })
    .await;
    let first = h.enqueue(update("item-1", json!({}))).await;
    let second = h.enqueue(update("item-2", json!({}))).await;

    let cancel = CancellationToken::new();
    let coordinator = SyncCoordinator::new(
        CoordinatorConfig::default(),
        CoordinatorParts {
            queue: h.queue.clone(),
            gate: Arc::new(DeviceConditionGate::new(
                GateConfig::default(),
                Arc::new(StaticProbe::online()),
                crate::utils::TimezoneConfig::default(),
            )),
            remote: Arc::new(CancellingRemote {
                inner: h.remote.clone(),
                cancel: cancel.clone(),
            }),
            auth: h.auth.clone(),
            detector: ConflictDetector::new(),
            resolver: h.resolver.clone(),
            status: h.status.clone(),
            events: h.events.clone(),
            clock: h.clock.clone(),
        },
    );

    let report = coordinator.run_cycle(SyncTrigger::Manual, &cancel).await;
    assert!(report.cancelled);
    assert_eq!(report.applied, 1);
    assert!(h.queue.get(&first.id).await.is_none());
    assert_eq!(
        h.queue.get(&second.id).await.unwrap().status,
        MutationStatus::Pending
    );
}

#[tokio::test]
async fn test_deadline_leaves_remaining_pending() {
    let h = Harness::with_options(HarnessOptions {
        queue: QueueConfig {
            batch_size: 1,
            ..QueueConfig::default()
        },
        coordinator: CoordinatorConfig {
            max_sync_duration_ms: 300_000,
            ..CoordinatorConfig::default()
        },
        ..HarnessOptions::default()
    })
    .await;
    h.remote.advance_clock_per_call(h.clock.clone(), 200_000);
    for i in 0..3 {
        h.enqueue(update(&format!("item-{}", i), json!({}))).await;
    }

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert!(report.deadline_reached);
    assert_eq!(report.applied, 2);
    assert_eq!(h.queue.stats().await.pending, 1);
    assert!(!h.queue.is_processing().await);
}

#[tokio::test]
async fn test_long_cycle_keeps_processing_lock() {
    let h = Harness::with_options(HarnessOptions {
        queue: QueueConfig {
            batch_size: 1,
            lock_staleness_ms: 60_000,
            ..QueueConfig::default()
        },
        coordinator: CoordinatorConfig {
            max_sync_duration_ms: 1_000_000,
            ..CoordinatorConfig::default()
        },
        ..HarnessOptions::default()
    })
    .await;
    h.remote.advance_clock_per_call(h.clock.clone(), 40_000);
    h.remote.set_delay(Duration::from_millis(200));
    for i in 0..3 {
        h.enqueue(update(&format!("item-{}", i), json!({}))).await;
    }

    let coordinator = h.coordinator.clone();
    let cycle = tokio::spawn(async move {
        coordinator
            .run_cycle(SyncTrigger::Manual, &CancellationToken::new())
            .await
    });

    // 第三次远端调用时周期已超过陈旧窗口，锁仍不能被接管
    while h.remote.calls().len() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.queue.is_processing().await);
    assert!(!h.queue.try_acquire_processing("intruder").await.unwrap());

    let report = cycle.await.unwrap();
    assert_eq!(report.applied, 3);
    assert!(!report.deadline_reached);
    assert!(!h.queue.is_processing().await);
}

#[tokio::test]
async fn test_apply_timeout_is_retryable() {
    let h = Harness::with_options(HarnessOptions {
        coordinator: CoordinatorConfig {
            apply_timeout_ms: 10,
            ..CoordinatorConfig::default()
        },
        ..HarnessOptions::default()
    })
    .await;
    h.remote.set_delay(Duration::from_millis(200));
    let mutation = h.enqueue(update("item-1", json!({}))).await;

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.retried, 1);
    let stored = h.queue.get(&mutation.id).await.unwrap();
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_failure_reason, Some(FailureReason::Timeout));
}

#[tokio::test]
async fn test_server_rejection_fails_and_emits_rollback_event() {
    let h = Harness::new().await;
    let rejected = h
        .enqueue(
            update("item-1", json!({"title": "bad"}))
                .with_previous(json!({"title": "good"}), 1)
                .optimistic(),
        )
        .await;
    let next = h.enqueue(update("item-1", json!({"title": "fine"}))).await;
    h.remote.script(
        &rejected.id,
        Err(RemoteError::ServerRejection {
            status: 422,
            message: "title too short".to_string(),
        }),
    );
    let mut events = h.events.subscribe();

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(h.remote.calls(), vec![rejected.id.clone(), next.id]);
    assert_eq!(
        h.queue.get(&rejected.id).await.unwrap().status,
        MutationStatus::Failed
    );
    assert!(status(&h).last_error.is_some());

    let mut rollback = None;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::MutationFailed {
            mutation_id,
            optimistic,
            previous_payload,
            ..
        } = event
        {
            rollback = Some((mutation_id, optimistic, previous_payload));
        }
    }
    assert_eq!(
        rollback,
        Some((rejected.id, true, Some(json!({"title": "good"}))))
    );
}

#[tokio::test]
async fn test_auth_refresh_resumes_drain() {
    let h = Harness::new().await;
    let mutation = h.enqueue(update("item-1", json!({}))).await;
    h.remote.script(&mutation.id, Err(RemoteError::AuthExpired));

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(h.auth.calls(), 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.outcome, CycleOutcome::Synced);
    assert_eq!(h.remote.call_count(&mutation.id), 2);
    assert!(h.queue.get(&mutation.id).await.is_none());
}

#[tokio::test]
async fn test_auth_refresh_exhaustion_fails_cycle() {
    let h = Harness::with_options(HarnessOptions {
        auth_succeeds: false,
        ..HarnessOptions::default()
    })
    .await;
    let mutation = h.enqueue(update("item-1", json!({}))).await;
    h.remote.script(&mutation.id, Err(RemoteError::AuthExpired));

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(h.auth.calls(), 3);
    assert!(matches!(report.outcome, CycleOutcome::Failed(_)));

    let status = status(&h);
    assert_eq!(status.sync_state, SyncState::Failed);
    assert!(status.last_error.is_some());

    let stored = h.queue.get(&mutation.id).await.unwrap();
    assert_eq!(stored.status, MutationStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert!(!h.queue.is_processing().await);
}

#[tokio::test]
async fn test_conflict_auto_merged_and_reapplied_in_same_cycle() {
    let h = Harness::with_options(HarnessOptions {
        resolution: ResolutionConfig::default()
            .with_clock_skew_tolerance_ms(0)
            .with_field_rule("quantity", FieldMergeRule::TakeLarger),
        ..HarnessOptions::default()
    })
    .await;
    let mutation = h
        .enqueue(update("item-1", json!({"quantity": 2})).with_previous(json!({"quantity": 1}), 1))
        .await;
    h.remote.script(
        &mutation.id,
        conflict_response(Some(json!({"quantity": 3})), h.clock.now_ms() + 10, 2),
    );

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.conflicts_detected, 1);
    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.outcome, CycleOutcome::Synced);

    let resolved_id = crate::conflict::ConflictId::for_mutation(&mutation.id).resolved_mutation_id();
    assert_eq!(h.remote.calls(), vec![mutation.id, resolved_id]);
    assert_eq!(h.queue.stats().await.total, 0);
    assert_eq!(h.resolver.log().len().await, 1);
}

#[tokio::test]
async fn test_unresolved_conflict_ends_in_conflicts_state() {
    let h = Harness::new().await;
    let mutation = h
        .enqueue(update("item-1", json!({"quantity": 2})).with_previous(json!({"quantity": 1}), 1))
        .await;
    let later = h.enqueue(update("item-1", json!({"quantity": 4}))).await;
    let other = h.enqueue(update("item-2", json!({"name": "bread"}))).await;
    h.remote.script(
        &mutation.id,
        conflict_response(Some(json!({"quantity": 3})), h.clock.now_ms(), 2),
    );

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.outcome, CycleOutcome::Conflicts);
    assert_eq!(report.conflicts_detected, 1);
    assert_eq!(report.conflicts_resolved, 0);
    assert_eq!(report.applied, 1);
    assert_eq!(h.remote.call_count(&later.id), 0);
    assert_eq!(h.remote.call_count(&other.id), 1);

    let status = status(&h);
    assert_eq!(status.sync_state, SyncState::Conflicts);
    assert_eq!(status.unresolved_conflicts, 1);
    assert_eq!(status.pending_changes, 1);
    assert_eq!(
        h.queue.get(&mutation.id).await.unwrap().status,
        MutationStatus::Conflict
    );
}

#[tokio::test]
async fn test_version_advance_without_conflict_rebases() {
    let h = Harness::new().await;
    let mutation = h
        .enqueue(update("item-1", json!({"v": 2})).with_previous(json!({"v": 1}), 1))
        .await;
    // 远端报告的版本与本地基线相同：不是冲突，rebase 后重试
    h.remote
        .script(&mutation.id, conflict_response(Some(json!({"v": 1})), 0, 1));

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.conflicts_detected, 0);
    assert_eq!(report.applied, 1);
    assert_eq!(h.remote.call_count(&mutation.id), 2);
}

#[tokio::test]
async fn test_repeated_rebase_stalls_cycle() {
    let h = Harness::new().await;
    let mutation = h
        .enqueue(update("item-1", json!({"v": 2})).with_previous(json!({"v": 1}), 1))
        .await;
    for _ in 0..2 {
        h.remote
            .script(&mutation.id, conflict_response(Some(json!({"v": 1})), 0, 1));
    }

    let report = h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;
    assert_eq!(report.deferred, 1);
    assert_eq!(h.remote.call_count(&mutation.id), 2);
    assert_eq!(
        h.queue.get(&mutation.id).await.unwrap().status,
        MutationStatus::Pending
    );
}

#[tokio::test]
async fn test_cycle_events_published() {
    let h = Harness::new().await;
    h.enqueue(update("item-1", json!({}))).await;
    let mut events = h.events.subscribe();

    h.coordinator.run_cycle(SyncTrigger::Manual, &manual()).await;

    let mut types = Vec::new();
    while let Ok(event) = events.try_recv() {
        types.push(event.event_type());
    }
    assert!(types.contains(&"mutation_applied"));
    assert!(types.contains(&"sync_progress"));
    assert_eq!(types.last(), Some(&"cycle_completed"));
}
