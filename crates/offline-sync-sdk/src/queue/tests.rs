use super::*;
use crate::storage::{KvStore, MemoryQueueStore, SledQueueStore};
use crate::test_support::{create, fixed_clock, update, T0};
use crate::utils::ManualClock;
use serde_json::json;
use tempfile::TempDir;

async fn open_queue(config: QueueConfig) -> (OfflineQueue, MemoryQueueStore, Arc<ManualClock>) {
    let store = MemoryQueueStore::new();
    let clock = fixed_clock();
    let queue = OfflineQueue::open(
        Arc::new(store.clone()),
        config,
        RetryPolicy::default(),
        clock.clone(),
    )
    .await
    .unwrap();
    (queue, store, clock)
}

async fn reopen(store: &MemoryQueueStore, clock: &Arc<ManualClock>) -> OfflineQueue {
    OfflineQueue::open(
        Arc::new(store.clone()),
        QueueConfig::default(),
        RetryPolicy::default(),
        clock.clone(),
    )
    .await
    .unwrap()
}

fn network_failure() -> AckOutcome {
    AckOutcome::RetryableFailure {
        error: "connection reset".to_string(),
        reason: FailureReason::Network,
    }
}

fn ids(batch: &[QueuedMutation]) -> Vec<MutationId> {
    batch.iter().map(|m| m.id.clone()).collect()
}

#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let (queue, store, _clock) = open_queue(QueueConfig::default()).await;
    let mutation = update("item-1", json!({"v": 1})).with_id("m-1");

    let first = queue.enqueue(mutation.clone()).await.unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(first.max_retries, Some(5));

    let second = queue
        .enqueue(update("item-1", json!({"v": 2})).with_id("m-1"))
        .await
        .unwrap();
    assert_eq!(second.payload, json!({"v": 1}));
    assert_eq!(queue.stats().await.total, 1);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_enqueue_stamps_creation_time_from_queue_clock() {
    let (queue, _store, clock) = open_queue(QueueConfig::default()).await;

    let first = queue.enqueue(update("item-1", json!({"v": 1}))).await.unwrap();
    assert_eq!(first.created_at, T0);

    clock.advance_ms(500);
    let second = queue.enqueue(update("item-1", json!({"v": 2}))).await.unwrap();
    assert_eq!(second.created_at, T0 + 500);

    // 调用方给定的时间保持不变
    let explicit = queue
        .enqueue(update("item-2", json!({"v": 1})).with_created_at(42))
        .await
        .unwrap();
    assert_eq!(explicit.created_at, 42);
}

#[tokio::test]
async fn test_enqueue_validates_input() {
    let (queue, _store, _clock) = open_queue(QueueConfig::default()).await;

    let missing_id = QueuedMutation::new(MutationKind::Delete, "item", None, json!(null), "u1");
    assert!(matches!(
        queue.enqueue(missing_id).await,
        Err(SyncError::InvalidInput(_))
    ));

    let empty_type = QueuedMutation::new(MutationKind::Create, " ", None, json!({}), "u1");
    assert!(matches!(
        queue.enqueue(empty_type).await,
        Err(SyncError::InvalidInput(_))
    ));

    // Create 可以没有 entity_id
    assert!(queue.enqueue(create(json!({"name": "milk"}))).await.is_ok());
}

#[tokio::test]
async fn test_queue_full_without_evictable_entries() {
    let (queue, _store, _clock) = open_queue(QueueConfig::default()).await;
    for i in 0..500 {
        queue
            .enqueue(update(&format!("item-{}", i), json!({"i": i})))
            .await
            .unwrap();
    }

    let err = queue
        .enqueue(update("item-500", json!({})))
        .await
        .unwrap_err();
    assert!(err.is_queue_full());
    assert!(matches!(
        err,
        SyncError::QueueFull {
            size: 500,
            capacity: 500
        }
    ));
}

#[tokio::test]
async fn test_eviction_prefers_completed_then_failed() {
    let config = QueueConfig {
        max_queue_size: 3,
        completed_history_limit: 10,
        ..QueueConfig::default()
    };
    let (queue, _store, _clock) = open_queue(config).await;

    let a = queue.enqueue(update("a", json!({}))).await.unwrap();
    let b = queue.enqueue(update("b", json!({}))).await.unwrap();
    let c = queue.enqueue(update("c", json!({}))).await.unwrap();

    queue.dequeue_batch(3).await.unwrap();
    queue
        .ack(
            &a.id,
            AckOutcome::PermanentFailure {
                error: "422".to_string(),
                reason: Some(FailureReason::ServerRejection(422)),
            },
        )
        .await
        .unwrap();
    assert_eq!(queue.ack(&b.id, AckOutcome::Completed).await.unwrap(), AckResult::Completed);
    queue.ack(&c.id, AckOutcome::Deferred).await.unwrap();

    // 先淘汰 Completed 的 b
    queue.enqueue(update("d", json!({}))).await.unwrap();
    assert!(queue.get(&b.id).await.is_none());
    assert!(queue.get(&a.id).await.is_some());

    // 再淘汰 Failed 的 a
    queue.enqueue(update("e", json!({}))).await.unwrap();
    assert!(queue.get(&a.id).await.is_none());

    // 只剩 Pending，拒绝
    assert!(queue
        .enqueue(update("f", json!({})))
        .await
        .unwrap_err()
        .is_queue_full());
}

#[tokio::test]
async fn test_dequeue_orders_by_priority_then_creation() {
    let (queue, _store, _clock) = open_queue(QueueConfig::default()).await;

    let low = queue
        .enqueue(update("a", json!({})).with_created_at(T0).with_priority(MutationPriority::Low))
        .await
        .unwrap();
    let normal_late = queue
        .enqueue(update("b", json!({})).with_created_at(T0 + 20))
        .await
        .unwrap();
    let normal_early = queue
        .enqueue(update("c", json!({})).with_created_at(T0 + 10))
        .await
        .unwrap();
    let critical = queue
        .enqueue(update("d", json!({})).with_created_at(T0 + 30).with_priority(MutationPriority::Critical))
        .await
        .unwrap();

    let pending: Vec<MutationId> = queue.peek_pending().await.into_iter().map(|m| m.id).collect();
    let expected = vec![critical.id, normal_early.id, normal_late.id, low.id];
    assert_eq!(pending, expected);

    let batch = queue.dequeue_batch(10).await.unwrap();
    assert_eq!(ids(&batch), expected);
    assert!(batch.iter().all(|m| m.status == MutationStatus::InProgress));
    assert!(queue.peek_pending().await.is_empty());
}

#[tokio::test]
async fn test_same_entity_never_reordered_by_priority() {
    let (queue, _store, _clock) = open_queue(QueueConfig::default()).await;

    let first = queue
        .enqueue(update("item-1", json!({"v": 1})).with_priority(MutationPriority::Background))
        .await
        .unwrap();
    let second = queue
        .enqueue(update("item-1", json!({"v": 2})).with_priority(MutationPriority::Critical))
        .await
        .unwrap();

    let batch = queue.dequeue_batch(1).await.unwrap();
    assert_eq!(ids(&batch), vec![first.id.clone()]);

    // 前序变更在处理中，后续变更不能单独出队
    assert!(queue.dequeue_batch(10).await.unwrap().is_empty());

    queue.ack(&first.id, AckOutcome::Completed).await.unwrap();
    let batch = queue.dequeue_batch(10).await.unwrap();
    assert_eq!(ids(&batch), vec![second.id]);
}

#[tokio::test]
async fn test_same_entity_batch_keeps_creation_order() {
    let (queue, _store, _clock) = open_queue(QueueConfig::default()).await;
    let m1 = queue.enqueue(update("item-1", json!({"v": 1}))).await.unwrap();
    let m2 = queue
        .enqueue(update("item-1", json!({"v": 2})).with_priority(MutationPriority::Critical))
        .await
        .unwrap();
    let m3 = queue.enqueue(update("item-1", json!({"v": 3}))).await.unwrap();

    let batch = queue.dequeue_batch(10).await.unwrap();
    assert_eq!(ids(&batch), vec![m1.id, m2.id, m3.id]);
}

#[tokio::test]
async fn test_dependencies_gate_dequeue() {
    let (queue, _store, _clock) = open_queue(QueueConfig::default()).await;

    let create = queue.enqueue(create(json!({"name": "milk"}))).await.unwrap();
    let dependent = queue
        .enqueue(
            QueuedMutation::new(MutationKind::Update, "tag", Some("t1".into()), json!({}), "u1")
                .with_priority(MutationPriority::Critical)
                .with_dependency(create.id.clone()),
        )
        .await
        .unwrap();

    let batch = queue.dequeue_batch(10).await.unwrap();
    assert_eq!(ids(&batch), vec![create.id.clone()]);

    queue.ack(&create.id, AckOutcome::Completed).await.unwrap();
    let batch = queue.dequeue_batch(10).await.unwrap();
    assert_eq!(ids(&batch), vec![dependent.id]);
}

#[tokio::test]
async fn test_retry_backoff_and_exhaustion() {
    let (queue, _store, clock) = open_queue(QueueConfig::default()).await;
    let mutation = queue
        .enqueue(update("item-1", json!({})).with_id("m-1"))
        .await
        .unwrap();

    let expected_delays = [30_000i64, 60_000, 120_000, 240_000];
    for (i, delay) in expected_delays.iter().enumerate() {
        let batch = queue.dequeue_batch(1).await.unwrap();
        assert_eq!(ids(&batch), vec![mutation.id.clone()], "attempt {}", i);

        let result = queue.ack(&mutation.id, network_failure()).await.unwrap();
        let now = clock.now_ms();
        assert_eq!(
            result,
            AckResult::RetryScheduled {
                retry_count: i as u32 + 1,
                not_before: now + delay,
            }
        );
        assert_eq!(queue.next_retry_at().await, Some(now + delay));

        // 退避期间不可出队
        assert!(queue.dequeue_batch(1).await.unwrap().is_empty());
        clock.advance_ms(*delay);
    }

    queue.dequeue_batch(1).await.unwrap();
    let result = queue.ack(&mutation.id, network_failure()).await.unwrap();
    assert_eq!(result, AckResult::Failed { retry_count: 5 });

    let failed = queue.get(&mutation.id).await.unwrap();
    assert_eq!(failed.status, MutationStatus::Failed);
    assert_eq!(failed.last_failure_reason, Some(FailureReason::Network));
    assert!(queue.dequeue_batch(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_entry_does_not_block_entity() {
    let (queue, _store, _clock) = open_queue(QueueConfig::default()).await;
    let rejected = queue.enqueue(update("item-1", json!({"v": 1}))).await.unwrap();
    let next = queue.enqueue(update("item-1", json!({"v": 2}))).await.unwrap();

    queue.dequeue_batch(1).await.unwrap();
    queue
        .ack(
            &rejected.id,
            AckOutcome::PermanentFailure {
                error: "invalid".to_string(),
                reason: Some(FailureReason::ServerRejection(400)),
            },
        )
        .await
        .unwrap();

    let batch = queue.dequeue_batch(10).await.unwrap();
    assert_eq!(ids(&batch), vec![next.id]);
}

#[tokio::test]
async fn test_conflict_ack_keeps_retry_count_and_blocks_entity() {
    let (queue, _store, clock) = open_queue(QueueConfig::default()).await;
    let mutation = queue.enqueue(update("item-1", json!({}))).await.unwrap();
    let later = queue.enqueue(update("item-1", json!({"v": 2}))).await.unwrap();

    queue.dequeue_batch(1).await.unwrap();
    queue.ack(&mutation.id, network_failure()).await.unwrap();
    clock.advance_ms(30_000);
    queue.dequeue_batch(1).await.unwrap();

    let result = queue
        .ack(
            &mutation.id,
            AckOutcome::Conflict {
                conflict_id: "c-1".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(result, AckResult::Conflict);

    let stored = queue.get(&mutation.id).await.unwrap();
    assert_eq!(stored.status, MutationStatus::Conflict);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(queue.stats().await.conflict, 1);

    // 冲突未解决前同实体的后续变更不出队
    assert!(queue.dequeue_batch(10).await.unwrap().is_empty());

    assert_eq!(
        queue.ack(&mutation.id, AckOutcome::Resolved).await.unwrap(),
        AckResult::Removed
    );
    assert_eq!(ids(&queue.dequeue_batch(10).await.unwrap()), vec![later.id]);
}

#[tokio::test]
async fn test_ack_rejects_invalid_transitions() {
    let (queue, _store, _clock) = open_queue(QueueConfig::default()).await;
    let mutation = queue.enqueue(update("item-1", json!({}))).await.unwrap();

    assert!(matches!(
        queue.ack(&mutation.id, AckOutcome::Completed).await,
        Err(SyncError::InvalidState(_))
    ));
    assert!(matches!(
        queue.ack(&MutationId::from("missing"), AckOutcome::Completed).await,
        Err(SyncError::NotFound(_))
    ));

    queue.dequeue_batch(1).await.unwrap();
    assert!(matches!(
        queue.ack(&mutation.id, AckOutcome::Resolved).await,
        Err(SyncError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_deferred_and_rebase_return_to_pending() {
    let (queue, _store, _clock) = open_queue(QueueConfig::default()).await;
    let mutation = queue
        .enqueue(update("item-1", json!({})).with_previous(json!({}), 3))
        .await
        .unwrap();

    queue.dequeue_batch(1).await.unwrap();
    assert_eq!(
        queue.ack(&mutation.id, AckOutcome::Deferred).await.unwrap(),
        AckResult::Released
    );
    let released = queue.get(&mutation.id).await.unwrap();
    assert_eq!(released.status, MutationStatus::Pending);
    assert_eq!(released.retry_count, 0);

    queue.dequeue_batch(1).await.unwrap();
    queue
        .ack(&mutation.id, AckOutcome::Rebase { base_version: 7 })
        .await
        .unwrap();
    let rebased = queue.get(&mutation.id).await.unwrap();
    assert_eq!(rebased.status, MutationStatus::Pending);
    assert_eq!(rebased.base_version, Some(7));
}

#[tokio::test]
async fn test_completed_history_is_bounded() {
    let config = QueueConfig {
        completed_history_limit: 1,
        ..QueueConfig::default()
    };
    let (queue, store, _clock) = open_queue(config).await;
    let a = queue.enqueue(update("a", json!({}))).await.unwrap();
    let b = queue.enqueue(update("b", json!({}))).await.unwrap();

    queue.dequeue_batch(2).await.unwrap();
    queue.ack(&a.id, AckOutcome::Completed).await.unwrap();
    queue.ack(&b.id, AckOutcome::Completed).await.unwrap();

    assert!(queue.get(&a.id).await.is_none());
    assert_eq!(queue.get(&b.id).await.unwrap().status, MutationStatus::Completed);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_restart_recovers_in_progress_and_sequence() {
    let (queue, store, clock) = open_queue(QueueConfig::default()).await;
    let a = queue.enqueue(update("a", json!({}))).await.unwrap();
    queue.enqueue(update("b", json!({}))).await.unwrap();
    queue.dequeue_batch(1).await.unwrap();
    drop(queue);

    let queue = reopen(&store, &clock).await;
    let recovered = queue.get(&a.id).await.unwrap();
    assert_eq!(recovered.status, MutationStatus::Pending);

    let c = queue.enqueue(update("c", json!({}))).await.unwrap();
    assert_eq!(c.sequence, 3);
    assert_eq!(queue.stats().await.pending, 3);
}

#[tokio::test]
async fn test_processing_lock() {
    let (queue, store, clock) = open_queue(QueueConfig::default()).await;

    assert!(queue.try_acquire_processing("cycle-1").await.unwrap());
    assert!(!queue.try_acquire_processing("cycle-2").await.unwrap());
    assert!(queue.is_processing().await);
    assert!(queue.stats().await.processing);

    // 非持有者释放无效
    queue.release_processing("cycle-2").await.unwrap();
    assert!(queue.is_processing().await);

    // 崩溃后锁仍然存在
    drop(queue);
    let queue = reopen(&store, &clock).await;
    assert!(queue.is_processing().await);
    assert!(!queue.try_acquire_processing("cycle-3").await.unwrap());

    // 超过陈旧窗口后可以接管
    clock.advance_ms(10 * 60 * 1000 + 1);
    assert!(!queue.is_processing().await);
    assert!(queue.try_acquire_processing("cycle-3").await.unwrap());
    queue.release_processing("cycle-3").await.unwrap();
    assert!(!queue.is_processing().await);
}

#[tokio::test]
async fn test_refresh_keeps_long_cycle_lock() {
    let (queue, _store, clock) = open_queue(QueueConfig::default()).await;
    assert!(queue.try_acquire_processing("cycle-1").await.unwrap());

    clock.advance_ms(9 * 60 * 1000);
    assert!(queue.refresh_processing("cycle-1").await.unwrap());
    assert!(!queue.refresh_processing("cycle-2").await.unwrap());

    // 续期后从续期时刻重新计算陈旧窗口
    clock.advance_ms(2 * 60 * 1000);
    assert!(queue.is_processing().await);
    assert!(!queue.try_acquire_processing("cycle-2").await.unwrap());

    queue.release_processing("cycle-1").await.unwrap();
    assert!(!queue.refresh_processing("cycle-1").await.unwrap());
}

#[tokio::test]
async fn test_stale_lock_cleared_on_open() {
    let (queue, store, clock) = open_queue(QueueConfig::default()).await;
    queue.try_acquire_processing("crashed").await.unwrap();
    drop(queue);

    clock.advance_ms(11 * 60 * 1000);
    let queue = reopen(&store, &clock).await;
    assert!(!queue.stats().await.processing);
    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn test_sled_backed_queue_persists() {
    let dir = TempDir::new().unwrap();
    let clock: Arc<dyn Clock> = ManualClock::new(T0);

    let id = {
        let kv = KvStore::new(dir.path()).await.unwrap();
        let store = Arc::new(SledQueueStore::open(&kv, "user-1").await.unwrap());
        let queue = OfflineQueue::open(store, QueueConfig::default(), RetryPolicy::default(), clock.clone())
            .await
            .unwrap();
        let mutation = queue.enqueue(update("item-1", json!({"v": 1}))).await.unwrap();
        queue.dequeue_batch(1).await.unwrap();
        mutation.id
    };

    let kv = KvStore::new(dir.path()).await.unwrap();
    let store = Arc::new(SledQueueStore::open(&kv, "user-1").await.unwrap());
    let queue = OfflineQueue::open(store, QueueConfig::default(), RetryPolicy::default(), clock)
        .await
        .unwrap();
    let restored = queue.get(&id).await.unwrap();
    assert_eq!(restored.status, MutationStatus::Pending);
    assert_eq!(restored.payload, json!({"v": 1}));
}
