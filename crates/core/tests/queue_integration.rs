//! Operation queue behavior under virtual time

#[path = "support.rs"]
mod support;

use std::collections::HashSet;
use std::time::Duration;

use support::{op, op_with_priority, Components};
use tidemark_core::testing::ScriptedExecutor;
use tidemark_core::ExecutionOutcome;
use tidemark_domain::{EventKind, OperationStatus, Priority};

#[tokio::test]
async fn added_operations_get_unique_pending_ids() {
    let c = Components::initialized(ScriptedExecutor::succeeding()).await;

    let mut ids = HashSet::new();
    for n in 0..20 {
        let id = c.queue.add(op(&format!("note.{n}"))).await.unwrap();
        let stored = c.queue.get(&id).unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert!(ids.insert(id), "ids must be unique");
    }
    assert_eq!(c.events_of(EventKind::OperationQueued), 20);
}

#[tokio::test]
async fn one_drain_processes_by_priority_then_age() {
    let c = Components::initialized(ScriptedExecutor::succeeding()).await;
    c.queue.add(op_with_priority("low", Priority::Low)).await.unwrap();
    c.queue.add(op_with_priority("critical", Priority::Critical)).await.unwrap();
    c.queue.add(op_with_priority("normal", Priority::Normal)).await.unwrap();

    let report = c.queue.drain().await.unwrap();

    assert_eq!(report.completed, 3);
    assert_eq!(c.executor.executed_types(), vec!["critical", "normal", "low"]);
}

#[tokio::test]
async fn always_failing_operation_stops_at_max_retries() {
    let c = Components::initialized(ScriptedExecutor::failing("503 unavailable")).await;
    let id = c.queue.add(op("note.update").with_max_retries(3)).await.unwrap();

    // Backoff without jitter: 1s, then 2s
    assert_eq!(c.queue.drain().await.unwrap().retried, 1);
    c.scheduler.advance(Duration::from_secs(1)).await;
    assert_eq!(c.queue.drain().await.unwrap().retried, 1);
    c.scheduler.advance(Duration::from_secs(2)).await;
    assert_eq!(c.queue.drain().await.unwrap().failed, 1);

    let failed = c.queue.get(&id).unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(failed.retry_count, 3);
    assert_eq!(failed.last_error.as_deref(), Some("503 unavailable"));

    c.scheduler.advance(Duration::from_secs(60)).await;
    assert_eq!(c.queue.drain().await.unwrap().attempted, 0);
    assert_eq!(c.executor.call_count(), 3);
    assert_eq!(c.events_of(EventKind::OperationFailed), 1);
}

#[tokio::test]
async fn backoff_delays_grow_between_attempts() {
    let c = Components::initialized(ScriptedExecutor::failing("timeout")).await;
    let id = c.queue.add(op("note.update").with_max_retries(5)).await.unwrap();

    let mut gaps = Vec::new();
    for _ in 0..4 {
        c.queue.drain().await.unwrap();
        let retrying = c.queue.get(&id).unwrap();
        let now = c.ctx.now_ms();
        let gap = retrying.next_attempt_at.unwrap() - now;
        gaps.push(gap);
        c.scheduler.advance(Duration::from_millis(gap)).await;
    }
    assert_eq!(gaps, vec![1_000, 2_000, 4_000, 8_000]);
}

#[tokio::test]
async fn retried_operation_is_attempted_again_by_a_later_drain() {
    let executor = ScriptedExecutor::failing("flaky");
    let c = Components::initialized(executor).await;
    let id = c.queue.add(op("note.create")).await.unwrap();

    c.queue.drain().await.unwrap();
    assert_eq!(c.queue.get(&id).unwrap().status, OperationStatus::Retrying);

    c.executor.set_responder(|_, _| ExecutionOutcome::success());
    c.scheduler.advance(Duration::from_secs(1)).await;
    assert_eq!(c.queue.get(&id).unwrap().status, OperationStatus::Pending);

    let report = c.queue.drain().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(c.queue.get(&id).unwrap().status, OperationStatus::Completed);
    assert_eq!(c.executor.executed_ids(), vec![id.clone(), id]);
}

#[tokio::test]
async fn elapsed_retrying_operation_is_eligible_without_its_timer() {
    let c = Components::initialized(ScriptedExecutor::failing("flaky")).await;
    let id = c.queue.add(op("note.create")).await.unwrap();
    c.queue.drain().await.unwrap();

    // Move time without running the backoff timer
    c.scheduler.clock().advance(Duration::from_secs(2));
    assert_eq!(c.queue.get(&id).unwrap().status, OperationStatus::Retrying);

    c.executor.set_responder(|_, _| ExecutionOutcome::success());
    let report = c.queue.drain().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.completed, 1);
}

#[tokio::test]
async fn operations_survive_a_restart() {
    let c = Components::initialized(ScriptedExecutor::succeeding()).await;
    let pending = c.queue.add(op("note.create")).await.unwrap();
    let interrupted = c.queue.add(op("note.update")).await.unwrap();
    c.queue.claim_eligible(Some(&["note.update".to_string()])).await.unwrap();

    c.queue.reload().await.unwrap();

    assert_eq!(c.queue.get(&pending).unwrap().status, OperationStatus::Pending);
    assert_eq!(c.queue.get(&interrupted).unwrap().status, OperationStatus::Pending);
    assert_eq!(c.queue.stats().outstanding(), 2);
}
