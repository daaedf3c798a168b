//! Fault-tolerant stage executor.
//!
//! Wraps one stage invocation with a per-attempt timeout, retry with
//! backoff for transient failures, and circuit breaker checks. Callers only
//! see the final outcome: a [`StageSuccess`] or one [`ExecutionError`]
//! carrying every attempt made.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    Admission, BackoffPolicy, BreakerRegistry, BreakerState, CircuitBreaker, FailureClassifier,
    FailureKind, TrialGuard,
};
use crate::cancellation::CancellationToken;
use crate::core::{AttemptOutcome, EngineEvent, OpenAttempt, StageAttempt};
use crate::errors::{
    CancellationError, ExecutionError, PermanentError, PermanentReason, StageFailure, TransientError,
};
use crate::events::{EventSink, NoOpEventSink};
use crate::workflow::{StageCall, StageCollaborator, StageInput};

/// Default total attempts per execute call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything needed to execute one stage once.
#[derive(Clone)]
pub struct StageRequest {
    /// The run the call belongs to.
    pub run_id: String,
    /// The stage being executed.
    pub stage_id: String,
    /// The external collaborator.
    pub collaborator: Arc<dyn StageCollaborator>,
    /// Input passed to every attempt.
    pub input: StageInput,
    /// Total attempts allowed, including the first.
    pub max_retries: u32,
    /// Deadline applied to each attempt.
    pub timeout: Duration,
}

impl StageRequest {
    /// Creates a request with the default retry budget and timeout.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage_id: impl Into<String>,
        collaborator: Arc<dyn StageCollaborator>,
        input: StageInput,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage_id: stage_id.into(),
            collaborator,
            input,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the total attempts allowed.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for StageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRequest")
            .field("run_id", &self.run_id)
            .field("stage_id", &self.stage_id)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A successful execute call.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSuccess {
    /// The collaborator's output.
    pub output: Value,
    /// Every attempt made, the last one SUCCESS.
    pub attempts: Vec<StageAttempt>,
}

enum CallOutcome {
    Returned(Value),
    Failed(StageFailure),
    TimedOut,
    Cancelled,
}

/// Executes stages with timeout, retry and circuit breaking.
pub struct StageExecutor {
    breakers: Arc<BreakerRegistry>,
    classifier: Arc<FailureClassifier>,
    backoff: BackoffPolicy,
    events: Arc<dyn EventSink>,
}

impl StageExecutor {
    /// Creates an executor over a breaker registry, with the standard
    /// classifier and default backoff.
    #[must_use]
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            breakers,
            classifier: Arc::new(FailureClassifier::new()),
            backoff: BackoffPolicy::default(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The shared breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Executes a stage.
    ///
    /// The breaker is consulted before every attempt. A rejection before the
    /// first attempt costs nothing: no attempt is recorded and the
    /// collaborator is not contacted.
    pub async fn execute(
        &self,
        request: StageRequest,
        cancel: &CancellationToken,
    ) -> Result<StageSuccess, ExecutionError> {
        let breaker = self.breakers.get(&request.stage_id);
        let max_attempts = request.max_retries.max(1);
        let input_bytes = serde_json::to_vec(&request.input).map_or(0, |b| b.len());
        let mut attempts: Vec<StageAttempt> = Vec::new();
        let mut last_error = String::new();

        let mut call = StageCall {
            run_id: request.run_id.clone(),
            stage_id: request.stage_id.clone(),
            attempt: 0,
            deadline: deadline_after(request.timeout),
            input: request.input.clone(),
            cancel: cancel.clone(),
        };

        for attempt_number in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(cancelled(&request.stage_id, cancel, attempts));
            }

            let admission = breaker.admit();
            match admission {
                Admission::Allowed => {}
                Admission::Probe => {
                    info!(stage = %request.stage_id, "Circuit half-open, sending probe");
                    self.breaker_event(&breaker, BreakerState::HalfOpen).await;
                }
                Admission::Rejected => {
                    warn!(
                        run_id = %request.run_id,
                        stage = %request.stage_id,
                        attempts = attempts.len(),
                        "Circuit open, attempt rejected"
                    );
                    return Err(PermanentError::circuit_open(&request.stage_id, attempts).into());
                }
            }

            let mut trial = breaker.guard_trial(admission);
            let open = OpenAttempt::begin(&request.stage_id, attempt_number);
            self.events
                .emit(EngineEvent::attempt_started(
                    &request.run_id,
                    &request.stage_id,
                    attempt_number,
                    input_bytes,
                ))
                .await;

            call.attempt = attempt_number;
            call.deadline = deadline_after(request.timeout);

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => CallOutcome::Cancelled,
                result = tokio::time::timeout(request.timeout, request.collaborator.invoke(&call)) => {
                    match result {
                        Ok(Ok(output)) => CallOutcome::Returned(output),
                        Ok(Err(failure)) => CallOutcome::Failed(failure),
                        Err(_) => CallOutcome::TimedOut,
                    }
                }
            };

            match outcome {
                CallOutcome::Returned(output) => {
                    let closed = breaker.record_success();
                    trial.disarm();
                    if let Some(state) = closed {
                        self.breaker_event(&breaker, state).await;
                    }
                    let attempt = open.succeed();
                    let output_bytes = serde_json::to_vec(&output).map(|b| b.len()).ok();
                    self.finish(&request.run_id, &attempt, output_bytes).await;
                    attempts.push(attempt);
                    return Ok(StageSuccess { output, attempts });
                }
                CallOutcome::Cancelled => {
                    drop(trial);
                    let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                    let attempt = open.fail(AttemptOutcome::Cancelled, reason, None);
                    self.finish(&request.run_id, &attempt, None).await;
                    attempts.push(attempt);
                    return Err(cancelled(&request.stage_id, cancel, attempts));
                }
                CallOutcome::TimedOut => {
                    last_error = format!("timed out after {}ms", request.timeout.as_millis());
                    let attempt = open.fail(
                        AttemptOutcome::Timeout,
                        last_error.clone(),
                        Some(FailureKind::Timeout),
                    );
                    self.record_failure(&breaker, &mut trial).await;
                    self.finish(&request.run_id, &attempt, None).await;
                    attempts.push(attempt);
                }
                CallOutcome::Failed(failure) => {
                    let classification = self.classifier.classify(&failure);
                    let detail = failure.to_string();
                    self.record_failure(&breaker, &mut trial).await;

                    if !classification.is_transient() {
                        let attempt = open.fail(
                            AttemptOutcome::PermanentFailure,
                            detail.clone(),
                            Some(classification.kind),
                        );
                        self.finish(&request.run_id, &attempt, None).await;
                        attempts.push(attempt);
                        warn!(
                            run_id = %request.run_id,
                            stage = %request.stage_id,
                            kind = %classification.kind,
                            "Permanent failure, not retrying"
                        );
                        return Err(PermanentError {
                            stage_id: request.stage_id,
                            reason: PermanentReason::Failure {
                                kind: classification.kind,
                                message: detail,
                            },
                            attempts,
                        }
                        .into());
                    }

                    let attempt = open.fail(
                        AttemptOutcome::TransientFailure,
                        detail.clone(),
                        Some(classification.kind),
                    );
                    self.finish(&request.run_id, &attempt, None).await;
                    attempts.push(attempt);
                    last_error = detail;
                }
            }

            drop(trial);
            if attempt_number < max_attempts {
                if breaker.state() == BreakerState::Open {
                    warn!(
                        run_id = %request.run_id,
                        stage = %request.stage_id,
                        attempts = attempts.len(),
                        "Circuit opened, abandoning remaining retries"
                    );
                    return Err(PermanentError::circuit_open(&request.stage_id, attempts).into());
                }
                let wait = self.backoff.delay(attempt_number);
                debug!(
                    stage = %request.stage_id,
                    attempt = attempt_number,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "Retrying after transient failure"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        return Err(cancelled(&request.stage_id, cancel, attempts));
                    }
                    () = tokio::time::sleep(wait) => {}
                }
            }
        }

        warn!(
            run_id = %request.run_id,
            stage = %request.stage_id,
            attempts = attempts.len(),
            "Retries exhausted"
        );
        Err(TransientError {
            stage_id: request.stage_id,
            attempts,
            last_error,
        }
        .into())
    }

    async fn record_failure(&self, breaker: &CircuitBreaker, trial: &mut TrialGuard<'_>) {
        let opened = breaker.record_failure();
        trial.disarm();
        if let Some(state) = opened {
            warn!(
                stage = %breaker.stage_id(),
                consecutive_failures = breaker.consecutive_failures(),
                "Circuit opened"
            );
            self.breaker_event(breaker, state).await;
        }
    }

    async fn breaker_event(&self, breaker: &CircuitBreaker, state: BreakerState) {
        self.events
            .emit(EngineEvent::breaker(
                breaker.stage_id(),
                &state.to_string(),
                breaker.consecutive_failures(),
            ))
            .await;
    }

    async fn finish(&self, run_id: &str, attempt: &StageAttempt, output_bytes: Option<usize>) {
        debug!(
            run_id,
            stage = %attempt.stage_id(),
            attempt = attempt.attempt_number(),
            outcome = %attempt.outcome(),
            duration_ms = attempt.duration_ms(),
            "Attempt finished"
        );
        self.events
            .emit(EngineEvent::attempt_finished(run_id, attempt, output_bytes))
            .await;
    }
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("breakers", &self.breakers.len())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

fn cancelled(stage_id: &str, cancel: &CancellationToken, attempts: Vec<StageAttempt>) -> ExecutionError {
    CancellationError {
        stage_id: Some(stage_id.to_string()),
        reason: cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
        attempts,
    }
    .into()
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}
