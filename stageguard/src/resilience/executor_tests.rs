use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{
    BackoffPolicy, BreakerConfig, BreakerRegistry, BreakerState, FailureKind, StageExecutor,
    StageRequest,
};
use crate::cancellation::CancellationToken;
use crate::core::AttemptOutcome;
use crate::errors::{ExecutionError, PermanentReason};
use crate::events::CollectingEventSink;
use crate::testing::{ScriptedCollaborator, ScriptedReply};
use crate::workflow::StageInput;

fn registry(threshold: u32) -> Arc<BreakerRegistry> {
    Arc::new(BreakerRegistry::new(BreakerConfig::new(
        threshold,
        Duration::from_secs(60),
    )))
}

fn request(run_id: &str, stage: &str, collaborator: &Arc<ScriptedCollaborator>) -> StageRequest {
    StageRequest::new(
        run_id,
        stage,
        collaborator.clone(),
        StageInput::new(json!({"goal": "ship"})),
    )
}

fn outcomes(err: &ExecutionError) -> Vec<AttemptOutcome> {
    err.attempts().iter().map(|a| a.outcome()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success() {
    let collaborator = Arc::new(ScriptedCollaborator::new([
        ScriptedReply::fail("connection reset by peer"),
        ScriptedReply::fail("503 service unavailable"),
        ScriptedReply::Ok(json!({"notes": "done"})),
    ]));
    let executor = StageExecutor::new(registry(5));

    let success = executor
        .execute(
            request("r1", "research", &collaborator).with_max_retries(3),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(success.output, json!({"notes": "done"}));
    let recorded: Vec<_> = success.attempts.iter().map(|a| a.outcome()).collect();
    assert_eq!(
        recorded,
        vec![
            AttemptOutcome::TransientFailure,
            AttemptOutcome::TransientFailure,
            AttemptOutcome::Success
        ]
    );
    assert_eq!(collaborator.attempt_numbers(), vec![1, 2, 3]);
    assert_eq!(executor.breakers().state("research"), Some(BreakerState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let collaborator = Arc::new(ScriptedCollaborator::failing("401 unauthorized"));
    let executor = StageExecutor::new(registry(5));

    let err = executor
        .execute(
            request("r1", "design", &collaborator).with_max_retries(3),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    let ExecutionError::Permanent(permanent) = &err else {
        panic!("expected permanent error, got {err:?}");
    };
    assert!(matches!(
        permanent.reason,
        PermanentReason::Failure {
            kind: FailureKind::Authentication,
            ..
        }
    ));
    assert_eq!(outcomes(&err), vec![AttemptOutcome::PermanentFailure]);
    assert_eq!(collaborator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let collaborator = Arc::new(ScriptedCollaborator::failing("rate limit exceeded"));
    let executor = StageExecutor::new(registry(10));

    let err = executor
        .execute(
            request("r1", "research", &collaborator).with_max_retries(4),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    let ExecutionError::Transient(transient) = &err else {
        panic!("expected transient error, got {err:?}");
    };
    assert_eq!(transient.attempts.len(), 4);
    assert!(transient.last_error.contains("rate limit"));
    assert_eq!(collaborator.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_mid_call_and_protects_other_runs() {
    let breakers = registry(2);
    let executor = StageExecutor::new(breakers.clone());
    let flaky = Arc::new(ScriptedCollaborator::failing("connection refused"));

    let err = executor
        .execute(
            request("run-a", "x", &flaky).with_max_retries(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    let ExecutionError::Permanent(permanent) = &err else {
        panic!("expected circuit open, got {err:?}");
    };
    assert!(permanent.is_circuit_open());
    assert_eq!(
        outcomes(&err),
        vec![AttemptOutcome::TransientFailure, AttemptOutcome::TransientFailure]
    );
    assert_eq!(flaky.calls(), 2);
    assert_eq!(breakers.state("x"), Some(BreakerState::Open));

    let healthy = Arc::new(ScriptedCollaborator::succeeding(json!("ok")));
    let err = executor
        .execute(request("run-b", "x", &healthy), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(&err, ExecutionError::Permanent(p) if p.is_circuit_open()));
    assert!(err.attempts().is_empty());
    assert_eq!(healthy.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_rejects_before_any_attempt() {
    let breakers = registry(1);
    breakers.get("x").record_failure();
    let collaborator = Arc::new(ScriptedCollaborator::succeeding(json!(1)));
    let events = Arc::new(CollectingEventSink::new());
    let executor = StageExecutor::new(breakers).with_event_sink(events.clone());

    let err = executor
        .execute(request("r1", "x", &collaborator), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.attempts().is_empty());
    assert_eq!(collaborator.calls(), 0);
    assert!(events.events_of_type("stage.attempt").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_half_open_probe_closes_breaker() {
    let breakers = registry(1);
    breakers.get("x").record_failure();
    let events = Arc::new(CollectingEventSink::new());
    let executor = StageExecutor::new(breakers.clone()).with_event_sink(events.clone());
    let collaborator = Arc::new(ScriptedCollaborator::succeeding(json!("recovered")));

    tokio::time::advance(Duration::from_secs(61)).await;
    let success = executor
        .execute(request("r1", "x", &collaborator), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(success.attempts.len(), 1);
    assert_eq!(breakers.state("x"), Some(BreakerState::Closed));
    assert_eq!(events.events_of_type("breaker.half_open").len(), 1);
    assert_eq!(events.events_of_type("breaker.closed").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_recorded_and_retried() {
    let collaborator = Arc::new(ScriptedCollaborator::new([
        ScriptedReply::Hang,
        ScriptedReply::Ok(json!("late but fine")),
    ]));
    let executor = StageExecutor::new(registry(5));

    let success = executor
        .execute(
            request("r1", "slow", &collaborator)
                .with_timeout(Duration::from_secs(2))
                .with_max_retries(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let first = &success.attempts[0];
    assert_eq!(first.outcome(), AttemptOutcome::Timeout);
    assert_eq!(first.failure_kind(), Some(FailureKind::Timeout));
    assert_eq!(success.attempts[1].outcome(), AttemptOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_call_finalizes_attempt() {
    let collaborator = Arc::new(ScriptedCollaborator::hanging());
    let breakers = registry(1);
    let executor = StageExecutor::new(breakers.clone());
    let cancel = CancellationToken::new();

    let trigger = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel("operator stop");
        }
    };
    let (result, ()) = tokio::join!(
        executor.execute(request("r1", "slow", &collaborator), &cancel),
        trigger
    );

    let err = result.unwrap_err();
    let ExecutionError::Cancelled(cancelled) = &err else {
        panic!("expected cancellation, got {err:?}");
    };
    assert_eq!(cancelled.reason, "operator stop");
    assert_eq!(outcomes(&err), vec![AttemptOutcome::Cancelled]);
    assert_eq!(breakers.state("slow"), Some(BreakerState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let collaborator = Arc::new(ScriptedCollaborator::failing("connection reset"));
    let executor = StageExecutor::new(registry(10))
        .with_backoff(BackoffPolicy::new().with_initial_wait_ms(5_000));
    let cancel = CancellationToken::new();

    let trigger = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            cancel.cancel("shutdown");
        }
    };
    let (result, ()) = tokio::join!(
        executor.execute(request("r1", "s", &collaborator).with_max_retries(3), &cancel),
        trigger
    );

    let err = result.unwrap_err();
    assert!(matches!(err, ExecutionError::Cancelled(_)));
    assert_eq!(outcomes(&err), vec![AttemptOutcome::TransientFailure]);
    assert_eq!(collaborator.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_before_start_makes_no_attempt() {
    let collaborator = Arc::new(ScriptedCollaborator::succeeding(json!(1)));
    let executor = StageExecutor::new(registry(5));
    let cancel = CancellationToken::new();
    cancel.cancel("never mind");

    let err = executor
        .execute(request("r1", "s", &collaborator), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutionError::Cancelled(_)));
    assert!(err.attempts().is_empty());
    assert_eq!(collaborator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_events_carry_sizes_not_payloads() {
    let collaborator = Arc::new(ScriptedCollaborator::succeeding(json!({"secret": "s3cr3t"})));
    let events = Arc::new(CollectingEventSink::new());
    let executor = StageExecutor::new(registry(5)).with_event_sink(events.clone());

    executor
        .execute(request("r1", "s", &collaborator), &CancellationToken::new())
        .await
        .unwrap();

    let finished = events.events_of_type("stage.attempt.finished");
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].outcome(), Some(AttemptOutcome::Success));
    assert!(finished[0].data.contains_key("output_bytes"));
    let rendered = serde_json::to_string(&events.events()).unwrap();
    assert!(!rendered.contains("s3cr3t"));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_execute_frees_half_open_slot() {
    let breakers = registry(1);
    breakers.get("x").record_failure();
    let executor = StageExecutor::new(breakers.clone());
    tokio::time::advance(Duration::from_secs(61)).await;

    let hanging = Arc::new(ScriptedCollaborator::hanging());
    let abandoned = tokio::time::timeout(
        Duration::from_secs(1),
        executor.execute(request("run-a", "x", &hanging), &CancellationToken::new()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(hanging.calls(), 1);
    assert_eq!(breakers.state("x"), Some(BreakerState::HalfOpen));

    let healthy = Arc::new(ScriptedCollaborator::succeeding(json!("recovered")));
    let success = executor
        .execute(request("run-b", "x", &healthy), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(success.output, json!("recovered"));
    assert_eq!(healthy.calls(), 1);
    assert_eq!(breakers.state("x"), Some(BreakerState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opening_skips_backoff_wait() {
    let collaborator = Arc::new(ScriptedCollaborator::failing("connection reset"));
    let executor = StageExecutor::new(registry(1))
        .with_backoff(BackoffPolicy::new().with_initial_wait_ms(5_000));
    let started = tokio::time::Instant::now();

    let err = executor
        .execute(
            request("r1", "x", &collaborator).with_max_retries(3),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(&err, ExecutionError::Permanent(p) if p.is_circuit_open()));
    assert_eq!(outcomes(&err), vec![AttemptOutcome::TransientFailure]);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(collaborator.calls(), 1);
}
