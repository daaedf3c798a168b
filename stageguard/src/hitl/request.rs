//! Approval and escalation request records, operator responses and the
//! notices published to operators.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::core::StageAttempt;
use crate::utils::{generate_request_id, now_utc, Timestamp};

/// An operator's verdict on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Continue at the proposed successor.
    Approved,
    /// Abort the run.
    Rejected,
    /// Continue at an operator-chosen stage.
    Modified,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Modified => write!(f, "modified"),
        }
    }
}

/// A pending or decided sign-off request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request identifier.
    pub request_id: Uuid,
    /// The paused run.
    pub run_id: String,
    /// The stage whose output is under review.
    pub stage_id: String,
    /// What the operator is asked to review.
    pub payload_to_review: Value,
    /// Successor taken on approval; `None` finishes the run.
    #[serde(default)]
    pub proposed_next: Option<String>,
    /// `None` while pending.
    #[serde(default)]
    pub decision: Option<ApprovalDecision>,
    /// Target chosen by a MODIFIED decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_target: Option<String>,
    /// True if the configured default was applied on timeout.
    #[serde(default)]
    pub automatic: bool,
    /// When the request was opened.
    pub created_at: Timestamp,
    /// When the decision was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<Timestamp>,
}

impl ApprovalRequest {
    /// Opens a new pending request.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage_id: impl Into<String>,
        payload_to_review: Value,
        proposed_next: Option<String>,
    ) -> Self {
        Self {
            request_id: generate_request_id(),
            run_id: run_id.into(),
            stage_id: stage_id.into(),
            payload_to_review,
            proposed_next,
            decision: None,
            modified_target: None,
            automatic: false,
            created_at: now_utc(),
            decided_at: None,
        }
    }

    /// Returns true until a decision is applied.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.decision.is_none()
    }

    /// Records a decision.
    pub fn apply(&mut self, response: &ApprovalResponse, automatic: bool) {
        self.decision = Some(response.decision);
        self.modified_target.clone_from(&response.modified_target);
        self.automatic = automatic;
        self.decided_at = Some(now_utc());
    }

    /// The notice published to operators.
    #[must_use]
    pub fn notice(&self) -> ApprovalNotice {
        ApprovalNotice {
            request_id: self.request_id,
            run_id: self.run_id.clone(),
            stage_id: self.stage_id.clone(),
            payload_to_review: self.payload_to_review.clone(),
        }
    }
}

/// An operator's answer to an approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// The request answered.
    pub request_id: Uuid,
    /// The verdict.
    pub decision: ApprovalDecision,
    /// Required for MODIFIED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_target: Option<String>,
}

impl ApprovalResponse {
    /// Approves the request.
    #[must_use]
    pub fn approve(request_id: Uuid) -> Self {
        Self {
            request_id,
            decision: ApprovalDecision::Approved,
            modified_target: None,
        }
    }

    /// Rejects the request.
    #[must_use]
    pub fn reject(request_id: Uuid) -> Self {
        Self {
            request_id,
            decision: ApprovalDecision::Rejected,
            modified_target: None,
        }
    }

    /// Redirects the run to `target`.
    #[must_use]
    pub fn modify(request_id: Uuid, target: impl Into<String>) -> Self {
        Self {
            request_id,
            decision: ApprovalDecision::Modified,
            modified_target: Some(target.into()),
        }
    }
}

/// Published when a run pauses for approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalNotice {
    /// Request identifier.
    pub request_id: Uuid,
    /// The paused run.
    pub run_id: String,
    /// The stage under review.
    pub stage_id: String,
    /// What to review.
    pub payload_to_review: Value,
}

/// Why a run was handed to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// The executor exhausted the retry budget.
    RetriesExhausted,
    /// The stage's breaker rejected the call.
    CircuitOpen,
    /// The run hit its total invocation cap.
    IterationLimit,
    /// The stage's routing asked for a human.
    Routed,
    /// A checkpoint could not be written.
    StorageFailure,
}

impl EscalationReason {
    /// Returns true if `resolution` may be applied to this kind of escalation.
    #[must_use]
    pub fn allows(&self, resolution: EscalationResolution) -> bool {
        match self {
            Self::StorageFailure => matches!(
                resolution,
                EscalationResolution::Retry | EscalationResolution::Abort
            ),
            Self::Routed => resolution != EscalationResolution::Skip,
            Self::RetriesExhausted | Self::CircuitOpen | Self::IterationLimit => true,
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::IterationLimit => write!(f, "iteration_limit"),
            Self::Routed => write!(f, "routed"),
            Self::StorageFailure => write!(f, "storage_failure"),
        }
    }
}

/// How an operator resolves an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationResolution {
    /// Re-enter the executor with a reset breaker.
    Retry,
    /// Record an explicit placeholder and continue routing.
    Skip,
    /// Fail the run.
    Abort,
    /// Re-enter the stage with operator-supplied input.
    SubstituteInput,
}

impl fmt::Display for EscalationResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
            Self::Abort => write!(f, "abort"),
            Self::SubstituteInput => write!(f, "substitute_input"),
        }
    }
}

/// A pending or resolved escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    /// Request identifier.
    pub request_id: Uuid,
    /// The paused run.
    pub run_id: String,
    /// The stage that could not proceed.
    pub stage_id: String,
    /// Why automation gave up.
    pub reason: EscalationReason,
    /// Human-readable failure context.
    pub detail: String,
    /// Attempts from the call that triggered the escalation.
    #[serde(default)]
    pub attempt_history: Vec<StageAttempt>,
    /// `None` while pending.
    #[serde(default)]
    pub resolution: Option<EscalationResolution>,
    /// Input supplied with SUBSTITUTE_INPUT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitute_input: Option<Value>,
    /// True if the configured default was applied on timeout.
    #[serde(default)]
    pub automatic: bool,
    /// When the request was opened.
    pub created_at: Timestamp,
    /// When the resolution was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
}

impl EscalationRequest {
    /// Opens a new pending escalation.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage_id: impl Into<String>,
        reason: EscalationReason,
        detail: impl Into<String>,
        attempt_history: Vec<StageAttempt>,
    ) -> Self {
        Self {
            request_id: generate_request_id(),
            run_id: run_id.into(),
            stage_id: stage_id.into(),
            reason,
            detail: detail.into(),
            attempt_history,
            resolution: None,
            substitute_input: None,
            automatic: false,
            created_at: now_utc(),
            resolved_at: None,
        }
    }

    /// Returns true until a resolution is applied.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }

    /// Records a resolution.
    pub fn apply(&mut self, response: &EscalationResponse, automatic: bool) {
        self.resolution = Some(response.resolution);
        self.substitute_input.clone_from(&response.substitute_input);
        self.automatic = automatic;
        self.resolved_at = Some(now_utc());
    }

    /// The notice published to operators.
    #[must_use]
    pub fn notice(&self) -> EscalationNotice {
        EscalationNotice {
            request_id: self.request_id,
            run_id: self.run_id.clone(),
            stage_id: self.stage_id.clone(),
            reason: self.reason,
            detail: self.detail.clone(),
            attempt_history: self.attempt_history.clone(),
        }
    }
}

/// An operator's answer to an escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationResponse {
    /// The request answered.
    pub request_id: Uuid,
    /// The chosen resolution.
    pub resolution: EscalationResolution,
    /// Required for SUBSTITUTE_INPUT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substitute_input: Option<Value>,
}

impl EscalationResponse {
    /// Creates a response without input.
    #[must_use]
    pub fn new(request_id: Uuid, resolution: EscalationResolution) -> Self {
        Self {
            request_id,
            resolution,
            substitute_input: None,
        }
    }

    /// Retry the stage.
    #[must_use]
    pub fn retry(request_id: Uuid) -> Self {
        Self::new(request_id, EscalationResolution::Retry)
    }

    /// Skip the stage.
    #[must_use]
    pub fn skip(request_id: Uuid) -> Self {
        Self::new(request_id, EscalationResolution::Skip)
    }

    /// Abort the run.
    #[must_use]
    pub fn abort(request_id: Uuid) -> Self {
        Self::new(request_id, EscalationResolution::Abort)
    }

    /// Re-run the stage with `input`.
    #[must_use]
    pub fn substitute(request_id: Uuid, input: Value) -> Self {
        Self {
            request_id,
            resolution: EscalationResolution::SubstituteInput,
            substitute_input: Some(input),
        }
    }
}

/// Published when a run is escalated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationNotice {
    /// Request identifier.
    pub request_id: Uuid,
    /// The paused run.
    pub run_id: String,
    /// The stage that could not proceed.
    pub stage_id: String,
    /// Why automation gave up.
    pub reason: EscalationReason,
    /// Failure context.
    pub detail: String,
    /// Attempts from the triggering call.
    pub attempt_history: Vec<StageAttempt>,
}

/// How a pause ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseOutcome<T> {
    /// An operator answered.
    Responded(T),
    /// The pause timed out and the configured default applies.
    DefaultApplied(T),
    /// The run was cancelled while paused.
    Cancelled,
}
