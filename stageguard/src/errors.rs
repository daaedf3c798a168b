//! Error types for the stageguard engine.
//!
//! The execution taxonomy is `TransientError` (retry budget exhausted),
//! `PermanentError` (non-retryable, or circuit open), `StorageError`
//! (checkpoint I/O, always fatal to the run) and `CancellationError`
//! (operator or system abort). Everything a public `Supervisor` operation
//! can fail with is collected in [`EngineError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::StageAttempt;
use crate::resilience::FailureKind;

/// A failure raised by a stage collaborator.
///
/// This is what the failure classifier inspects. The optional status code is
/// part of the rendered message so that rules such as `5xx` can match it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Human-readable failure description.
    pub message: String,
    /// Status code reported by the external service, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl StageFailure {
    /// Creates a failure from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    /// Creates a failure with a service status code.
    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "status {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for StageFailure {}

impl From<anyhow::Error> for StageFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Raised when a stage's retry budget is exhausted on recoverable failures.
#[derive(Debug, Clone, Error)]
#[error("stage '{stage_id}' exhausted {} attempt(s): {last_error}", attempts.len())]
pub struct TransientError {
    /// The stage that failed.
    pub stage_id: String,
    /// Every attempt made during the call, in order.
    pub attempts: Vec<StageAttempt>,
    /// Detail of the final failure.
    pub last_error: String,
}

/// Why a permanent error was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PermanentReason {
    /// The stage's circuit breaker rejected the attempt.
    CircuitOpen,
    /// The collaborator raised a non-retryable failure.
    Failure {
        /// Classified sub-kind.
        kind: FailureKind,
        /// Failure detail.
        message: String,
    },
}

impl fmt::Display for PermanentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => f.write_str("circuit open"),
            Self::Failure { kind, message } => write!(f, "{kind} failure: {message}"),
        }
    }
}

/// Raised for non-retryable failures; always short-circuits remaining retries.
#[derive(Debug, Clone, Error)]
#[error("stage '{stage_id}': {reason}")]
pub struct PermanentError {
    /// The stage that failed.
    pub stage_id: String,
    /// What made the failure permanent.
    pub reason: PermanentReason,
    /// Attempts made before giving up (empty when the circuit was open up front).
    pub attempts: Vec<StageAttempt>,
}

impl PermanentError {
    /// Creates a circuit-open error.
    #[must_use]
    pub fn circuit_open(stage_id: impl Into<String>, attempts: Vec<StageAttempt>) -> Self {
        Self {
            stage_id: stage_id.into(),
            reason: PermanentReason::CircuitOpen,
            attempts,
        }
    }

    /// Returns true if the breaker rejected the call.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self.reason, PermanentReason::CircuitOpen)
    }
}

/// Raised when the run-level cancellation signal fires.
#[derive(Debug, Clone, Error)]
#[error("cancelled{}: {reason}", stage_id.as_ref().map(|s| format!(" during stage '{s}'")).unwrap_or_default())]
pub struct CancellationError {
    /// The stage in flight when cancellation was observed, if any.
    pub stage_id: Option<String>,
    /// The cancellation reason.
    pub reason: String,
    /// Attempts made before cancellation; the last one is finalized CANCELLED.
    pub attempts: Vec<StageAttempt>,
}

/// The result of a failed `StageExecutor::execute` call.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// Retries exhausted.
    #[error(transparent)]
    Transient(#[from] TransientError),
    /// Non-retryable failure or open circuit.
    #[error(transparent)]
    Permanent(#[from] PermanentError),
    /// Cancelled mid-call.
    #[error(transparent)]
    Cancelled(#[from] CancellationError),
}

impl ExecutionError {
    /// Returns the attempts made by the failed call.
    #[must_use]
    pub fn attempts(&self) -> &[StageAttempt] {
        match self {
            Self::Transient(e) => &e.attempts,
            Self::Permanent(e) => &e.attempts,
            Self::Cancelled(e) => &e.attempts,
        }
    }
}

/// Errors raised by checkpoint stores.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failed.
    #[error("checkpoint I/O failed for run '{run_id}': {source}")]
    Io {
        /// Run whose checkpoint was being accessed.
        run_id: String,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint could not be encoded or decoded.
    #[error("checkpoint serialization failed for run '{run_id}': {message}")]
    Serialization {
        /// Run whose checkpoint was being accessed.
        run_id: String,
        /// Encoder/decoder message.
        message: String,
    },

    /// A write did not advance the run's sequence number.
    #[error("out-of-order checkpoint for run '{run_id}': sequence {attempted} is not after {latest}")]
    SequenceConflict {
        /// The run.
        run_id: String,
        /// Latest durable sequence.
        latest: u64,
        /// Rejected sequence.
        attempted: u64,
    },

    /// No checkpoint exists for the run.
    #[error("no checkpoint found for run '{run_id}'")]
    NotFound {
        /// The run.
        run_id: String,
    },

    /// A stored checkpoint failed its integrity check.
    #[error("corrupt checkpoint for run '{run_id}': {detail}")]
    Corrupt {
        /// The run.
        run_id: String,
        /// What failed to verify.
        detail: String,
    },

    /// The run id cannot be used as a storage key.
    #[error("invalid run id '{run_id}'")]
    InvalidRunId {
        /// The rejected id.
        run_id: String,
    },

    /// The store could not service the request.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Returns true if the error means "no such checkpoint".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors raised when a workflow definition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// The workflow has no stages.
    #[error("workflow '{workflow}' has no stages")]
    Empty {
        /// Workflow name.
        workflow: String,
    },

    /// Two stages share an id.
    #[error("duplicate stage id '{stage}'")]
    DuplicateStage {
        /// The repeated id.
        stage: String,
    },

    /// No entry stage was designated and none could be inferred.
    #[error("workflow '{workflow}' has no entry stage")]
    MissingEntry {
        /// Workflow name.
        workflow: String,
    },

    /// The entry stage does not exist.
    #[error("entry stage '{stage}' is not defined")]
    UnknownEntry {
        /// The entry id.
        stage: String,
    },

    /// A static route points at an undefined stage.
    #[error("stage '{from}' routes to undefined stage '{to}'")]
    UnknownTarget {
        /// Routing stage.
        from: String,
        /// Undefined target.
        to: String,
    },
}

/// Errors raised by the approval gate and escalation manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HitlError {
    /// No open request has this id.
    #[error("no open request '{request_id}'")]
    UnknownRequest {
        /// The request id.
        request_id: String,
    },

    /// The run already has an open request.
    #[error("run '{run_id}' already has open request '{request_id}'")]
    RequestAlreadyOpen {
        /// The run.
        run_id: String,
        /// The request already open.
        request_id: String,
    },

    /// A MODIFIED decision did not name a target stage.
    #[error("modified decision requires a target stage")]
    MissingTarget,

    /// A MODIFIED decision named a stage that does not exist.
    #[error("target stage '{target}' is not defined")]
    UnknownTarget {
        /// The rejected target.
        target: String,
    },

    /// A SUBSTITUTE_INPUT resolution carried no input.
    #[error("substitute_input resolution requires an input value")]
    MissingSubstituteInput,

    /// The resolution is not valid for this escalation.
    #[error("resolution '{resolution}' is not allowed for {reason} escalations")]
    ResolutionNotAllowed {
        /// Rejected resolution.
        resolution: String,
        /// Escalation reason.
        reason: String,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// File path.
        path: String,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config document is malformed.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The main error type for supervisor operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow definition is invalid.
    #[error("{0}")]
    Definition(#[from] DefinitionError),

    /// A checkpoint could not be written or read.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// A human-in-the-loop request failed.
    #[error("{0}")]
    Hitl(#[from] HitlError),

    /// Configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The run is already being driven in this process.
    #[error("run '{run_id}' is already active")]
    RunAlreadyActive {
        /// The run.
        run_id: String,
    },

    /// A checkpoint belongs to a different workflow.
    #[error("run '{run_id}' belongs to workflow '{found}', not '{expected}'")]
    WorkflowMismatch {
        /// The run.
        run_id: String,
        /// Workflow supplied by the caller.
        expected: String,
        /// Workflow recorded in the checkpoint.
        found: String,
    },

    /// A stage id is not part of the workflow.
    #[error("stage '{stage}' is not defined")]
    UnknownStage {
        /// The stage id.
        stage: String,
    },
}
