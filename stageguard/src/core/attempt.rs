//! Stage attempt records.
//!
//! An attempt is opened before the collaborator is called and finalized
//! exactly once afterwards. Only finalized attempts are [`StageAttempt`]s, so
//! a record can never be observed half-written or changed after the fact.

use serde::{Deserialize, Serialize};

use super::AttemptOutcome;
use crate::resilience::FailureKind;
use crate::utils::{now_utc, Timestamp};

/// One timed invocation of a stage's collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAttempt {
    stage_id: String,
    attempt_number: u32,
    started_at: Timestamp,
    ended_at: Timestamp,
    outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_kind: Option<FailureKind>,
}

impl StageAttempt {
    /// The stage the attempt belongs to.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// 1-based attempt number within one executor call.
    #[must_use]
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    /// When the attempt started.
    #[must_use]
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// When the attempt was finalized.
    #[must_use]
    pub fn ended_at(&self) -> Timestamp {
        self.ended_at
    }

    /// How the attempt ended.
    #[must_use]
    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    /// Failure detail, if the attempt did not succeed.
    #[must_use]
    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    /// Classified failure sub-kind, if any.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure_kind
    }

    /// Returns the attempt duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

/// An attempt that has started and not yet been finalized.
#[derive(Debug)]
#[must_use = "an open attempt must be finalized"]
pub struct OpenAttempt {
    stage_id: String,
    attempt_number: u32,
    started_at: Timestamp,
}

impl OpenAttempt {
    /// Records the start of an attempt.
    pub fn begin(stage_id: impl Into<String>, attempt_number: u32) -> Self {
        Self {
            stage_id: stage_id.into(),
            attempt_number,
            started_at: now_utc(),
        }
    }

    /// The attempt number.
    #[must_use]
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    /// Finalizes the attempt as a success.
    pub fn succeed(self) -> StageAttempt {
        self.finish(AttemptOutcome::Success, None, None)
    }

    /// Finalizes the attempt with a non-success outcome.
    pub fn fail(
        self,
        outcome: AttemptOutcome,
        detail: impl Into<String>,
        kind: Option<FailureKind>,
    ) -> StageAttempt {
        self.finish(outcome, Some(detail.into()), kind)
    }

    fn finish(
        self,
        outcome: AttemptOutcome,
        error_detail: Option<String>,
        failure_kind: Option<FailureKind>,
    ) -> StageAttempt {
        StageAttempt {
            stage_id: self.stage_id,
            attempt_number: self.attempt_number,
            started_at: self.started_at,
            ended_at: now_utc(),
            outcome,
            error_detail,
            failure_kind,
        }
    }
}
