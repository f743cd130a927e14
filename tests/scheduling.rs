use anvilq::core::{PoolObservation, ScalerState, ScalingDecision, evaluate};
use anvilq::metrics::{ResourceUsage, StaticResourceProbe};
use anvilq::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

async fn anvil(config: AnvilConfig) -> Anvil {
    let anvil = Anvil::new(config)
        .await
        .unwrap()
        .with_resource_probe(Arc::new(StaticResourceProbe::new(1.0, 1.0)));
    anvil
        .register_fn("noop", |_ctx, _args| async move { Ok(json!(null)) })
        .await;
    anvil
        .register_fn("always_fails", |ctx, _args| async move {
            Err(AnvilError::transient(format!("attempt {} failed", ctx.attempt)))
        })
        .await;
    anvil
}

async fn wait_for(anvil: &Anvil, task_id: &TaskId, state: TaskState) -> Task {
    for _ in 0..1000 {
        let task = anvil.get_task(task_id).await.unwrap();
        if task.state == state {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {state}");
}

#[tokio::test]
async fn partition_routing_is_deterministic_across_instances() {
    let first = anvil(AnvilConfig::testing().with_partitions(32)).await;
    let second = anvil(AnvilConfig::testing().with_partitions(32)).await;

    for category in ["billing", "email", "reports", "thumbnails"] {
        let descriptor = TaskDescriptor::new("noop")
            .category(category)
            .worker_type("CPU_INTENSIVE");
        let a = first.submit(descriptor.clone()).await.unwrap();
        let b = second.submit(descriptor.clone()).await.unwrap();
        let again = first.submit(descriptor).await.unwrap();

        assert_eq!(a.partition, b.partition);
        assert_eq!(a.partition, again.partition);
        assert!(a.partition < 32);
    }
}

#[tokio::test]
async fn higher_priority_is_always_popped_first() {
    let anvil = anvil(AnvilConfig::testing()).await;
    let submissions = [
        ("LOW", "a"),
        ("MAINTENANCE", "b"),
        ("EMERGENCY", "c"),
        ("NORMAL", "d"),
        ("EMERGENCY", "e"),
        ("HIGH", "f"),
    ];
    for (priority, category) in submissions {
        anvil
            .submit(
                TaskDescriptor::new("noop")
                    .priority(priority)
                    .category(category)
                    .worker_type("IO_INTENSIVE"),
            )
            .await
            .unwrap();
    }

    let partitions = anvil.config().partitions.assigned();
    let mut popped = Vec::new();
    while let Some(task) = anvil
        .queue()
        .try_pop(WorkerType::IoIntensive, &partitions)
        .await
        .unwrap()
    {
        popped.push(task.priority);
    }

    assert_eq!(
        popped,
        vec![
            TaskPriority::Emergency,
            TaskPriority::Emergency,
            TaskPriority::High,
            TaskPriority::Normal,
            TaskPriority::Low,
            TaskPriority::Maintenance,
        ]
    );
}

#[tokio::test]
async fn exhausted_task_records_every_attempt() {
    let anvil = anvil(AnvilConfig::testing()).await;
    anvil.start().await.unwrap();

    let receipt = anvil
        .submit(TaskDescriptor::new("always_fails").max_retries(2))
        .await
        .unwrap();
    let task = wait_for(&anvil, &receipt.task_id, TaskState::DeadLettered).await;
    assert_eq!(task.attempt_count, 3);

    let letters = anvil
        .list_dead_letters(&DeadLetterFilter {
            function_name: Some("always_fails".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].errors.len(), 3);
    let attempts: Vec<u32> = letters[0].errors.iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let metrics = anvil.get_metrics().await.unwrap();
    assert_eq!(metrics.totals.failed_attempts, 3);
    assert_eq!(metrics.totals.retried, 2);
    assert_eq!(metrics.totals.dead_lettered, 1);

    anvil.stop().await.unwrap();
}

#[tokio::test]
async fn replayed_dead_letter_runs_again() {
    let anvil = anvil(AnvilConfig::testing()).await;
    anvil.start().await.unwrap();

    let receipt = anvil
        .submit(TaskDescriptor::new("always_fails").max_retries(0))
        .await
        .unwrap();
    wait_for(&anvil, &receipt.task_id, TaskState::DeadLettered).await;

    // Fix the handler, then replay.
    anvil
        .register_fn("always_fails", |_ctx, _args| async move { Ok(json!("fixed")) })
        .await;
    let replayed = anvil.retry_dead_letter(&receipt.task_id).await.unwrap();
    let done = wait_for(&anvil, &replayed.id, TaskState::Completed).await;
    assert_eq!(done.result, Some(json!("fixed")));
    assert_eq!(done.replayed_from.as_ref(), Some(&receipt.task_id));

    anvil.stop().await.unwrap();
}

#[tokio::test]
async fn batch_reports_the_invalid_index() {
    let anvil = anvil(AnvilConfig::testing()).await;
    let descriptors: Vec<TaskDescriptor> = (0..10)
        .map(|i| {
            if i == 3 {
                TaskDescriptor::new("noop").worker_type("QUANTUM")
            } else {
                TaskDescriptor::new("noop").args(vec![json!(i)])
            }
        })
        .collect();

    let report = anvil.submit_batch(descriptors, BatchMode::Sequential).await;
    assert_eq!(report.total_submitted, 9);
    assert_eq!(report.total_errors, 1);
    assert_eq!(report.errors[0].index, 3);
    assert!(report.errors[0].error.contains("worker_type"));
}

#[tokio::test]
async fn locks_exclude_concurrent_handlers() {
    let anvil = anvil(AnvilConfig {
        workers: anvilq::config::WorkerConfig::uniform(4).with_idle_wait(20),
        ..AnvilConfig::testing()
    })
    .await;

    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    {
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        anvil
            .register_fn("critical", move |ctx, _args| {
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                async move {
                    let guard = ctx
                        .locks()
                        .acquire_timeout("shared", Duration::from_secs(5), Duration::from_secs(7))
                        .await?;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    guard.release().await?;
                    Ok::<_, AnvilError>(json!(null))
                }
            })
            .await;
    }
    anvil.start().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..8 {
        let receipt = anvil
            .submit(
                TaskDescriptor::new("critical")
                    .worker_type("IO_INTENSIVE")
                    .timeout(Duration::from_secs(8)),
            )
            .await
            .unwrap();
        ids.push(receipt.task_id);
    }
    for id in &ids {
        wait_for(&anvil, id, TaskState::Completed).await;
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);

    // Held locks are visible to callers outside any handler.
    let guard = anvil.locks().acquire("shared", Duration::from_secs(5)).await.unwrap();
    let busy = anvil.locks().acquire("shared", Duration::from_secs(5)).await;
    assert!(matches!(busy, Err(AnvilError::LockBusy { .. })));
    assert!(assert_ok!(guard.release().await));

    anvil.stop().await.unwrap();
}

#[test]
fn autoscaler_stays_within_bounds() {
    let bounds = PoolConfig::new(2, 6);
    let policy = AutoscalerConfig {
        cooldown_secs: 1,
        idle_window_secs: 1,
        ..Default::default()
    };
    let mut state = ScalerState::default();
    let mut workers = 2;
    let mut now = Instant::now();
    let usage = ResourceUsage::default();

    for _ in 0..20 {
        let observation = PoolObservation {
            backlog: 1_000,
            current_workers: workers,
            resources: usage,
        };
        if let Some(target) = evaluate(&mut state, &observation, &bounds, &policy, now).target() {
            workers = target;
        }
        assert!(workers <= 6);
        now += Duration::from_secs(2);
    }
    assert_eq!(workers, 6);

    for _ in 0..20 {
        let observation = PoolObservation {
            backlog: 0,
            current_workers: workers,
            resources: usage,
        };
        let decision = evaluate(&mut state, &observation, &bounds, &policy, now);
        if let ScalingDecision::ScaleDown { to, .. } = decision {
            workers = to;
        }
        assert!(workers >= 2);
        now += Duration::from_secs(2);
    }
    assert_eq!(workers, 2);
}

#[cfg(feature = "redis-queue")]
#[tokio::test]
async fn unreachable_store_falls_back_to_memory_mode() {
    let mut queue = QueueConfig::redis(["redis://127.0.0.1:1"]).with_memory_fallback(true);
    queue.visibility_timeout_secs = 10;
    if let QueueBackendConfig::Redis(redis) = &mut queue.backend {
        redis.connect_timeout_secs = 1;
    }
    let anvil = anvil(AnvilConfig {
        queue,
        ..AnvilConfig::testing()
    })
    .await;
    assert_eq!(anvil.queue().kind(), "memory-fallback");

    anvil.start().await.unwrap();
    let receipt = anvil.submit(TaskDescriptor::new("noop")).await.unwrap();
    wait_for(&anvil, &receipt.task_id, TaskState::Completed).await;
    assert_eq!(anvil.health_check().await.unwrap(), HealthStatus::Degraded);
    anvil.stop().await.unwrap();
}

#[cfg(feature = "redis-queue")]
#[tokio::test]
async fn unreachable_store_without_fallback_fails() {
    let mut queue = QueueConfig::redis(["redis://127.0.0.1:1"]);
    queue.visibility_timeout_secs = 10;
    if let QueueBackendConfig::Redis(redis) = &mut queue.backend {
        redis.connect_timeout_secs = 1;
    }
    let result = Anvil::new(AnvilConfig {
        queue,
        ..AnvilConfig::testing()
    })
    .await;
    assert_err!(result);
}
