//! Run status and attempt outcome enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The supervisor is driving stages.
    #[default]
    Running,
    /// Waiting for a human to approve the proposed next step.
    PausedApproval,
    /// Waiting for a human to resolve an escalation.
    PausedHitl,
    /// Routing reached a terminal step.
    Succeeded,
    /// A permanent failure or an ABORT resolution ended the run.
    Failed,
    /// Rejected at an approval gate or cancelled.
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::PausedApproval => write!(f, "paused_approval"),
            Self::PausedHitl => write!(f, "paused_hitl"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl RunStatus {
    /// Returns true if no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Returns true if the run is waiting on a human.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::PausedApproval | Self::PausedHitl)
    }
}

/// How a single stage attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The collaborator returned an output.
    Success,
    /// The collaborator failed with a recoverable failure.
    TransientFailure,
    /// The collaborator failed with a non-retryable failure.
    PermanentFailure,
    /// The call exceeded the stage timeout.
    Timeout,
    /// The run was cancelled while the call was in flight.
    Cancelled,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::TransientFailure => write!(f, "transient_failure"),
            Self::PermanentFailure => write!(f, "permanent_failure"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl AttemptOutcome {
    /// Returns true if the outcome counts against the circuit breaker.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::TransientFailure | Self::PermanentFailure | Self::Timeout
        )
    }
}
