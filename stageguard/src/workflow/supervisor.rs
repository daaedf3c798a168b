//! The supervisor: drives runs through their stages.
//!
//! One run is driven by one task at a time. Each loop iteration applies a
//! single transition, chosen by the run's status and cursor:
//!
//! - `Dispatch` executes the stage through the [`StageExecutor`], appends
//!   the result and checkpoints.
//! - `Completed` evaluates the stage's routing. A `Goto` only moves the
//!   cursor; it is re-derived from recorded results on resume, so it is not
//!   checkpointed on its own.
//! - A paused run waits on the approval gate or the escalation manager.
//!
//! A failed checkpoint write never lets the run continue. The run pauses
//! with a storage-failure escalation and an operator decides whether to
//! reload the last durable checkpoint or fail the run.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use super::{Cursor, PendingRequest, Route, WorkflowDefinition, WorkflowRun};
use crate::cancellation::CancellationToken;
use crate::checkpoint::{
    check_run_id, Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
use crate::config::EngineConfig;
use crate::core::{EngineEvent, RunStatus, StageAttempt};
use crate::errors::{EngineError, ExecutionError, StorageError};
use crate::events::{EventSink, NoOpEventSink};
use crate::hitl::{
    ApprovalDecision, ApprovalGate, ApprovalNotifier, ApprovalRequest, ApprovalResponse,
    EscalationManager, EscalationNotifier, EscalationReason, EscalationRequest,
    EscalationResolution, EscalationResponse, PauseOutcome,
};
use crate::observability::{run_span, stage_span, SpanTimer};
use crate::resilience::{BreakerRegistry, StageExecutor, StageRequest};
use crate::utils::generate_run_id;

/// Builder for a [`Supervisor`].
pub struct SupervisorBuilder {
    config: EngineConfig,
    breakers: Option<Arc<BreakerRegistry>>,
    store: Option<Arc<dyn CheckpointStore>>,
    events: Option<Arc<dyn EventSink>>,
    approval_notifier: Option<Arc<dyn ApprovalNotifier>>,
    escalation_notifier: Option<Arc<dyn EscalationNotifier>>,
}

impl SupervisorBuilder {
    /// Shares an existing breaker registry, e.g. across supervisors.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Sets the checkpoint store, overriding `config.checkpoint`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets where approval notices go.
    #[must_use]
    pub fn with_approval_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.approval_notifier = Some(notifier);
        self
    }

    /// Sets where escalation notices go.
    #[must_use]
    pub fn with_escalation_notifier(mut self, notifier: Arc<dyn EscalationNotifier>) -> Self {
        self.escalation_notifier = Some(notifier);
        self
    }

    /// Validates the configuration and builds the supervisor.
    pub fn build(self) -> Result<Supervisor, EngineError> {
        let config = self.config;
        config.validate()?;
        let classifier = Arc::new(config.build_classifier()?);

        let breakers = self
            .breakers
            .unwrap_or_else(|| Arc::new(BreakerRegistry::new(config.breaker.clone())));
        let store: Arc<dyn CheckpointStore> = match self.store {
            Some(store) => store,
            None => match &config.checkpoint.directory {
                Some(directory) => Arc::new(
                    FileCheckpointStore::new(directory.clone())
                        .with_keep_history(config.checkpoint.keep_history),
                ),
                None => Arc::new(InMemoryCheckpointStore::with_history(
                    config.checkpoint.keep_history,
                )),
            },
        };
        let events: Arc<dyn EventSink> = self.events.unwrap_or_else(|| Arc::new(NoOpEventSink));

        let executor = StageExecutor::new(breakers.clone())
            .with_classifier(classifier)
            .with_backoff(config.backoff.clone())
            .with_event_sink(events.clone());

        let mut approvals = ApprovalGate::new(config.approval.clone());
        if let Some(notifier) = self.approval_notifier {
            approvals = approvals.with_notifier(notifier);
        }
        let mut escalations = EscalationManager::new(config.escalation.clone());
        if let Some(notifier) = self.escalation_notifier {
            escalations = escalations.with_notifier(notifier);
        }

        Ok(Supervisor {
            config,
            executor,
            breakers,
            store,
            approvals: Arc::new(approvals),
            escalations: Arc::new(escalations),
            events,
            active: DashMap::new(),
        })
    }
}

impl std::fmt::Debug for SupervisorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Drives workflow runs. Share it behind an `Arc` to host many runs.
pub struct Supervisor {
    config: EngineConfig,
    executor: StageExecutor,
    breakers: Arc<BreakerRegistry>,
    store: Arc<dyn CheckpointStore>,
    approvals: Arc<ApprovalGate>,
    escalations: Arc<EscalationManager>,
    events: Arc<dyn EventSink>,
    active: DashMap<String, ()>,
}

/// Marks a run as driven by this process until dropped.
struct ActiveRun<'a> {
    active: &'a DashMap<String, ()>,
    run_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

impl Supervisor {
    /// Starts building a supervisor.
    #[must_use]
    pub fn builder(config: EngineConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            breakers: None,
            store: None,
            events: None,
            approval_notifier: None,
            escalation_notifier: None,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The approval gate. Operators answer through [`Supervisor::respond_approval`].
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    /// The escalation manager.
    #[must_use]
    pub fn escalations(&self) -> &Arc<EscalationManager> {
        &self.escalations
    }

    /// The breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// The checkpoint store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Runs currently driven by this supervisor.
    #[must_use]
    pub fn active_runs(&self) -> Vec<String> {
        let mut runs: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        runs.sort();
        runs
    }

    /// Answers an open approval request.
    pub fn respond_approval(&self, response: ApprovalResponse) -> Result<(), EngineError> {
        Ok(self.approvals.respond(response)?)
    }

    /// Resolves an open escalation.
    pub fn resolve_escalation(&self, response: EscalationResponse) -> Result<(), EngineError> {
        Ok(self.escalations.resolve(response)?)
    }

    /// Loads the latest durable state of a run.
    pub async fn load_run(&self, run_id: &str) -> Result<WorkflowRun, EngineError> {
        Ok(self.store.load_run(run_id).await?)
    }

    /// Starts a run with a generated id and drives it until it ends.
    pub async fn start(
        &self,
        workflow: &WorkflowDefinition,
        goal: Value,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, EngineError> {
        self.start_with_id(workflow, generate_run_id(), goal, cancel)
            .await
    }

    /// Starts a run with a caller-chosen id and drives it until it ends.
    ///
    /// The id must not have checkpoints already; use [`Supervisor::resume`]
    /// for those.
    pub async fn start_with_id(
        &self,
        workflow: &WorkflowDefinition,
        run_id: impl Into<String>,
        goal: Value,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, EngineError> {
        let run_id = run_id.into();
        check_run_id(&run_id)?;
        let _active = self.claim(&run_id)?;

        if let Some(&latest) = self.store.sequences(&run_id).await?.last() {
            return Err(StorageError::SequenceConflict {
                run_id,
                latest,
                attempted: 1,
            }
            .into());
        }

        let mut run = WorkflowRun::new(&run_id, workflow.name(), workflow.entry(), goal);
        info!(run_id = %run_id, workflow = %workflow.name(), entry = %workflow.entry(), "Run started");
        self.events
            .emit(
                EngineEvent::new("run.started")
                    .for_run(&run_id)
                    .for_stage(workflow.entry())
                    .add_data("workflow", json!(workflow.name())),
            )
            .await;
        self.commit(&mut run, RunStatus::Running).await;

        self.drive(workflow, &mut run, cancel)
            .instrument(run_span(&run_id, workflow.name()))
            .await?;
        Ok(run)
    }

    /// Resumes a run from its latest checkpoint and drives it until it ends.
    ///
    /// Breakers the registry has not seen yet are restored from the
    /// checkpoint; live breakers keep their state. A pending approval or
    /// escalation is re-opened and re-announced.
    pub async fn resume(
        &self,
        workflow: &WorkflowDefinition,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, EngineError> {
        let _active = self.claim(run_id)?;
        let checkpoint = self.store.load(run_id).await?;
        if checkpoint.run.workflow() != workflow.name() {
            return Err(EngineError::WorkflowMismatch {
                run_id: run_id.to_string(),
                expected: workflow.name().to_string(),
                found: checkpoint.run.workflow().to_string(),
            });
        }

        let restored = self.breakers.restore_missing(&checkpoint.breakers);
        let mut run = checkpoint.run;
        info!(
            run_id,
            sequence = run.sequence(),
            status = %run.status(),
            stage = %run.current_stage(),
            restored_breakers = restored,
            "Run resumed"
        );
        self.events
            .emit(
                EngineEvent::new("run.resumed")
                    .for_run(run_id)
                    .for_stage(run.current_stage())
                    .add_data("sequence", json!(run.sequence()))
                    .add_data("status", json!(run.status()))
                    .add_data("restored_breakers", json!(restored)),
            )
            .await;

        if !run.status().is_terminal() {
            self.drive(workflow, &mut run, cancel)
                .instrument(run_span(run_id, workflow.name()))
                .await?;
        }
        Ok(run)
    }

    /// Resumes every stored, unfinished run of `workflow` concurrently.
    ///
    /// Used after a process restart. Results are ordered by run id; a run
    /// whose checkpoint cannot be read is reported with its error.
    pub async fn resume_all(
        &self,
        workflow: &WorkflowDefinition,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Result<WorkflowRun, EngineError>)>, EngineError> {
        let mut results = Vec::new();
        let mut resuming = FuturesUnordered::new();
        for run_id in self.store.list_runs().await? {
            match self.store.load_run(&run_id).await {
                Ok(run) if run.workflow() != workflow.name() || run.status().is_terminal() => {}
                Ok(_) => resuming.push(async move {
                    let result = self.resume(workflow, &run_id, cancel).await;
                    (run_id, result)
                }),
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "Cannot read run for resume");
                    results.push((run_id, Err(err.into())));
                }
            }
        }

        info!(workflow = %workflow.name(), runs = resuming.len(), "Resuming unfinished runs");
        while let Some(resumed) = resuming.next().await {
            results.push(resumed);
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    fn claim(&self, run_id: &str) -> Result<ActiveRun<'_>, EngineError> {
        match self.active.entry(run_id.to_string()) {
            Entry::Occupied(_) => Err(EngineError::RunAlreadyActive {
                run_id: run_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ActiveRun {
                    active: &self.active,
                    run_id: run_id.to_string(),
                })
            }
        }
    }

    async fn drive(
        &self,
        workflow: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            match run.status() {
                RunStatus::Running => self.step(workflow, run, cancel).await,
                RunStatus::PausedApproval => self.await_approval(workflow, run, cancel).await?,
                RunStatus::PausedHitl => self.await_escalation(workflow, run, cancel).await?,
                RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted => break,
            }
        }

        info!(
            run_id = %run.run_id(),
            status = %run.status(),
            invocations = run.invocations(),
            attempts = run.attempts().len(),
            "Run finished"
        );
        let mut event = EngineEvent::new("run.finished")
            .for_run(run.run_id())
            .add_data("status", json!(run.status()))
            .add_data("invocations", json!(run.invocations()))
            .add_data("completed_stages", json!(run.completed_stages().len()));
        if let Some(detail) = run.detail() {
            event = event.add_data("detail", json!(detail));
        }
        self.events.emit(event).await;
        Ok(())
    }

    async fn step(
        &self,
        workflow: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) {
        match run.cursor().clone() {
            Cursor::Dispatch {
                stage_id,
                substitute,
            } => {
                self.dispatch(workflow, run, &stage_id, substitute, cancel)
                    .await;
            }
            Cursor::Completed { stage_id } => self.route(workflow, run, &stage_id).await,
        }
    }

    async fn dispatch(
        &self,
        workflow: &WorkflowDefinition,
        run: &mut WorkflowRun,
        stage_id: &str,
        substitute: Option<Value>,
        cancel: &CancellationToken,
    ) {
        let Some(stage) = workflow.stage(stage_id) else {
            error!(run_id = %run.run_id(), stage = stage_id, "Cursor names an undefined stage");
            run.finish(
                RunStatus::Failed,
                Some(EngineError::UnknownStage {
                    stage: stage_id.to_string(),
                }
                .to_string()),
            );
            self.commit(run, RunStatus::Running).await;
            return;
        };

        if run.invocations >= self.config.max_total_invocations {
            let detail = format!(
                "{} stage invocations reached the limit of {}",
                run.invocations, self.config.max_total_invocations
            );
            self.escalate(run, stage_id, EscalationReason::IterationLimit, detail, Vec::new())
                .await;
            return;
        }

        if cancel.is_cancelled() {
            self.abort_cancelled(run, cancel, RunStatus::Running).await;
            return;
        }

        run.invocations += 1;
        let request = StageRequest::new(
            run.run_id(),
            stage_id,
            stage.collaborator().clone(),
            run.stage_input(substitute),
        )
        .with_max_retries(stage.effective_max_retries(&self.config.stage_defaults))
        .with_timeout(stage.effective_timeout(&self.config.stage_defaults));

        let result = self
            .executor
            .execute(request, cancel)
            .instrument(stage_span(run.run_id(), stage_id, run.invocations))
            .await;

        match result {
            Ok(success) => {
                run.attempts.extend(success.attempts);
                run.record_completed(stage_id, success.output);
                self.commit(run, RunStatus::Running).await;
            }
            Err(ExecutionError::Permanent(err)) if err.is_circuit_open() => {
                run.attempts.extend(err.attempts.iter().cloned());
                let detail = err.to_string();
                self.escalate(run, stage_id, EscalationReason::CircuitOpen, detail, err.attempts)
                    .await;
            }
            Err(ExecutionError::Permanent(err)) => {
                run.attempts.extend(err.attempts.iter().cloned());
                warn!(run_id = %run.run_id(), stage = stage_id, error = %err, "Stage failed permanently");
                run.finish(RunStatus::Failed, Some(err.to_string()));
                self.commit(run, RunStatus::Running).await;
            }
            Err(ExecutionError::Transient(err)) => {
                run.attempts.extend(err.attempts.iter().cloned());
                let detail = err.to_string();
                self.escalate(
                    run,
                    stage_id,
                    EscalationReason::RetriesExhausted,
                    detail,
                    err.attempts,
                )
                .await;
            }
            Err(ExecutionError::Cancelled(err)) => {
                run.attempts.extend(err.attempts);
                self.abort_cancelled(run, cancel, RunStatus::Running).await;
            }
        }
    }

    async fn route(&self, workflow: &WorkflowDefinition, run: &mut WorkflowRun, stage_id: &str) {
        let Some(stage) = workflow.stage(stage_id) else {
            run.finish(
                RunStatus::Failed,
                Some(EngineError::UnknownStage {
                    stage: stage_id.to_string(),
                }
                .to_string()),
            );
            self.commit(run, RunStatus::Running).await;
            return;
        };

        let route = stage.routing_policy().decide(run);
        debug!(run_id = %run.run_id(), stage = stage_id, ?route, "Routing decided");

        match route {
            Route::Goto { stage: next } if workflow.contains(&next) => {
                run.dispatch(next, None);
            }
            Route::Goto { stage: next } => {
                self.fail_unknown_target(run, stage_id, &next).await;
            }
            Route::Terminal => {
                run.finish(RunStatus::Succeeded, None);
                self.commit(run, RunStatus::Running).await;
            }
            Route::AwaitApproval { next } => {
                if let Some(target) = next.as_deref().filter(|t| !workflow.contains(t)) {
                    let target = target.to_string();
                    self.fail_unknown_target(run, stage_id, &target).await;
                    return;
                }
                let payload = run.latest_output(stage_id).cloned().unwrap_or(Value::Null);
                let request = ApprovalRequest::new(run.run_id(), stage_id, payload, next);
                run.status = RunStatus::PausedApproval;
                run.pending = Some(PendingRequest::Approval(request));
                self.commit(run, RunStatus::Running).await;
            }
            Route::Escalate { reason } => {
                self.escalate(run, stage_id, EscalationReason::Routed, reason, Vec::new())
                    .await;
            }
        }
    }

    async fn fail_unknown_target(&self, run: &mut WorkflowRun, from: &str, target: &str) {
        warn!(run_id = %run.run_id(), stage = from, next = target, "Routed to an undefined stage");
        run.finish(
            RunStatus::Failed,
            Some(format!("stage '{from}' routed to undefined stage '{target}'")),
        );
        self.commit(run, RunStatus::Running).await;
    }

    async fn escalate(
        &self,
        run: &mut WorkflowRun,
        stage_id: &str,
        reason: EscalationReason,
        detail: String,
        attempts: Vec<StageAttempt>,
    ) {
        let from = run.status();
        let request = EscalationRequest::new(run.run_id(), stage_id, reason, detail, attempts);
        run.status = RunStatus::PausedHitl;
        run.pending = Some(PendingRequest::Escalation(request));
        self.commit(run, from).await;
    }

    async fn abort_cancelled(&self, run: &mut WorkflowRun, cancel: &CancellationToken, from: RunStatus) {
        let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
        info!(run_id = %run.run_id(), reason = %reason, "Run cancelled");
        run.finish(RunStatus::Aborted, Some(format!("cancelled: {reason}")));
        self.commit(run, from).await;
    }

    /// Aborts a run cancelled while paused. Nothing is left to recover, so
    /// a failed save is returned instead of pausing again.
    async fn abort_paused(
        &self,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
        from: RunStatus,
    ) -> Result<(), EngineError> {
        let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
        info!(run_id = %run.run_id(), reason = %reason, status = %from, "Paused run cancelled");
        run.finish(RunStatus::Aborted, Some(format!("cancelled: {reason}")));
        self.commit_final(run, from).await
    }

    async fn await_approval(
        &self,
        workflow: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let Some(PendingRequest::Approval(mut request)) = run.pending.clone() else {
            run.finish(
                RunStatus::Failed,
                Some("paused for approval without an open request".to_string()),
            );
            self.commit(run, RunStatus::PausedApproval).await;
            return Ok(());
        };

        let waiter = self
            .approvals
            .open(&request, workflow.stage_ids().to_vec())?;
        self.events
            .emit(
                EngineEvent::new("approval.requested")
                    .for_run(run.run_id())
                    .for_stage(&request.stage_id)
                    .add_data("request_id", json!(request.request_id))
                    .add_data("proposed_next", json!(request.proposed_next)),
            )
            .await;

        let (response, automatic) = match self
            .approvals
            .wait(waiter, request.request_id, cancel)
            .await
        {
            PauseOutcome::Responded(response) => (response, false),
            PauseOutcome::DefaultApplied(response) => (response, true),
            PauseOutcome::Cancelled => {
                run.pending = None;
                run.approvals.push(request);
                return self
                    .abort_paused(run, cancel, RunStatus::PausedApproval)
                    .await;
            }
        };

        request.apply(&response, automatic);
        info!(
            run_id = %run.run_id(),
            stage = %request.stage_id,
            decision = %response.decision,
            automatic,
            "Approval decided"
        );
        self.events
            .emit(
                EngineEvent::new("approval.decided")
                    .for_run(run.run_id())
                    .for_stage(&request.stage_id)
                    .add_data("request_id", json!(request.request_id))
                    .add_data("decision", json!(response.decision))
                    .add_data("automatic", json!(automatic)),
            )
            .await;

        run.pending = None;
        match (response.decision, &request.proposed_next, &response.modified_target) {
            (ApprovalDecision::Approved, Some(next), _) => run.dispatch(next.clone(), None),
            (ApprovalDecision::Approved, None, _) => run.finish(RunStatus::Succeeded, None),
            (ApprovalDecision::Modified, _, Some(target)) => run.dispatch(target.clone(), None),
            (ApprovalDecision::Modified, _, None) => run.finish(
                RunStatus::Failed,
                Some("modified approval without a target".to_string()),
            ),
            (ApprovalDecision::Rejected, _, _) => run.finish(
                RunStatus::Aborted,
                Some(format!("rejected at approval of stage '{}'", request.stage_id)),
            ),
        }
        run.approvals.push(request);
        self.commit(run, RunStatus::PausedApproval).await;
        Ok(())
    }

    async fn await_escalation(
        &self,
        workflow: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let Some(PendingRequest::Escalation(mut request)) = run.pending.clone() else {
            run.finish(
                RunStatus::Failed,
                Some("paused for escalation without an open request".to_string()),
            );
            self.commit(run, RunStatus::PausedHitl).await;
            return Ok(());
        };
        let reason = request.reason;

        let waiter = self.escalations.open(&request)?;
        self.events
            .emit(
                EngineEvent::new("escalation.requested")
                    .for_run(run.run_id())
                    .for_stage(&request.stage_id)
                    .add_data("request_id", json!(request.request_id))
                    .add_data("reason", json!(reason))
                    .add_data("attempts", json!(request.attempt_history.len())),
            )
            .await;

        let (response, automatic) = match self
            .escalations
            .wait(waiter, request.request_id, reason, cancel)
            .await
        {
            PauseOutcome::Responded(response) => (response, false),
            PauseOutcome::DefaultApplied(response) => (response, true),
            PauseOutcome::Cancelled => {
                run.pending = None;
                run.escalations.push(request);
                return self.abort_paused(run, cancel, RunStatus::PausedHitl).await;
            }
        };

        request.apply(&response, automatic);
        let resolution = response.resolution;
        info!(
            run_id = %run.run_id(),
            stage = %request.stage_id,
            reason = %reason,
            resolution = %resolution,
            automatic,
            "Escalation resolved"
        );
        self.events
            .emit(
                EngineEvent::new("escalation.resolved")
                    .for_run(run.run_id())
                    .for_stage(&request.stage_id)
                    .add_data("request_id", json!(request.request_id))
                    .add_data("resolution", json!(resolution))
                    .add_data("automatic", json!(automatic)),
            )
            .await;

        run.pending = None;
        if reason == EscalationReason::StorageFailure {
            return self.recover_storage(workflow, run, request).await;
        }

        let stage_id = request.stage_id.clone();
        match resolution {
            EscalationResolution::Retry => {
                self.breakers.reset(&stage_id);
                if reason == EscalationReason::IterationLimit {
                    run.invocations = 0;
                }
                run.dispatch(stage_id, None);
            }
            EscalationResolution::SubstituteInput => {
                run.dispatch(stage_id, response.substitute_input);
            }
            EscalationResolution::Skip => {
                run.status = RunStatus::Running;
                run.record_skipped(&stage_id, format!("skipped by operator after {reason}"));
            }
            EscalationResolution::Abort => {
                run.finish(
                    RunStatus::Failed,
                    Some(format!("aborted by operator after {reason}: {}", request.detail)),
                );
            }
        }
        run.escalations.push(request);
        self.commit(run, RunStatus::PausedHitl).await;
        Ok(())
    }

    /// Applies the resolution of a storage-failure escalation.
    async fn recover_storage(
        &self,
        workflow: &WorkflowDefinition,
        run: &mut WorkflowRun,
        request: EscalationRequest,
    ) -> Result<(), EngineError> {
        if request.resolution != Some(EscalationResolution::Retry) {
            let detail = format!("aborted after storage failure: {}", request.detail);
            run.escalations.push(request);
            run.finish(RunStatus::Failed, Some(detail));
            return self.commit_final(run, RunStatus::PausedHitl).await;
        }

        match self.store.load(run.run_id()).await {
            Ok(checkpoint) => {
                self.breakers.restore_missing(&checkpoint.breakers);
                let mut durable = checkpoint.run;
                durable.escalations.push(request);
                info!(
                    run_id = %durable.run_id(),
                    sequence = durable.sequence(),
                    stage = %durable.current_stage(),
                    "Reloaded last durable checkpoint"
                );
                *run = durable;
            }
            Err(err) if err.is_not_found() => {
                let mut fresh = WorkflowRun::new(
                    run.run_id(),
                    run.workflow(),
                    workflow.entry(),
                    run.goal().clone(),
                );
                fresh.escalations.push(request);
                *run = fresh;
                info!(run_id = %run.run_id(), "No durable checkpoint, restarting from entry");
                self.commit(run, RunStatus::PausedHitl).await;
            }
            Err(err) => {
                run.escalations.push(request);
                pause_for_storage(run, &err);
            }
        }
        Ok(())
    }

    /// Checkpoints a completed transition.
    ///
    /// On failure the run pauses for a human instead of continuing.
    async fn commit(&self, run: &mut WorkflowRun, from: RunStatus) {
        if let Err(err) = self.save(run, from).await {
            pause_for_storage(run, &err);
        }
    }

    /// Checkpoints a terminal transition that has no further recovery.
    async fn commit_final(&self, run: &mut WorkflowRun, from: RunStatus) -> Result<(), EngineError> {
        self.save(run, from).await.map_err(|err| {
            error!(run_id = %run.run_id(), error = %err, "Final checkpoint failed");
            EngineError::Storage(err)
        })
    }

    async fn save(&self, run: &mut WorkflowRun, from: RunStatus) -> Result<(), StorageError> {
        run.sequence += 1;
        run.touch();
        let checkpoint = Checkpoint::capture(run, self.breakers.snapshot());
        let timer = SpanTimer::start("checkpoint.save");
        self.store.save(&checkpoint).await?;
        let duration_ms = timer.finish();

        debug!(
            run_id = %run.run_id(),
            sequence = run.sequence(),
            status = %run.status(),
            duration_ms,
            "Checkpoint saved"
        );
        self.events
            .emit(
                EngineEvent::new("checkpoint.saved")
                    .for_run(run.run_id())
                    .add_data("sequence", json!(run.sequence()))
                    .add_data("breakers", json!(checkpoint.breakers.len())),
            )
            .await;
        if from != run.status() {
            self.events
                .emit(EngineEvent::transition(
                    run.run_id(),
                    Some(run.current_stage()),
                    from,
                    run.status(),
                    run.sequence(),
                ))
                .await;
        }
        Ok(())
    }
}

/// Pauses a run whose checkpoint could not be written. The pause itself is
/// not durable; the last durable checkpoint is what a retry reloads.
fn pause_for_storage(run: &mut WorkflowRun, err: &StorageError) {
    error!(
        run_id = %run.run_id(),
        sequence = run.sequence(),
        error = %err,
        "Checkpoint write failed, pausing run"
    );
    let request = EscalationRequest::new(
        run.run_id(),
        run.current_stage(),
        EscalationReason::StorageFailure,
        err.to_string(),
        Vec::new(),
    );
    run.status = RunStatus::PausedHitl;
    run.pending = Some(PendingRequest::Escalation(request));
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}
