//! Structured engine events.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{AttemptOutcome, RunStatus, StageAttempt};

/// An event emitted by the engine for observability.
///
/// Events carry identifiers, kinds, counts and sizes. They never carry stage
/// inputs, outputs or other payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    /// The event type (e.g., "stage.attempt.finished").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The run the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// The stage the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// Additional attributes.
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl EngineEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            run_id: None,
            stage: None,
            data: BTreeMap::new(),
        }
    }

    /// Sets the run id.
    #[must_use]
    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the stage.
    #[must_use]
    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Creates a "stage.attempt.started" event.
    #[must_use]
    pub fn attempt_started(run_id: &str, stage: &str, attempt_number: u32, input_bytes: usize) -> Self {
        Self::new("stage.attempt.started")
            .for_run(run_id)
            .for_stage(stage)
            .add_data("attempt", serde_json::json!(attempt_number))
            .add_data("input_bytes", serde_json::json!(input_bytes))
    }

    /// Creates a "stage.attempt.finished" event from a finalized attempt.
    #[must_use]
    pub fn attempt_finished(run_id: &str, attempt: &StageAttempt, output_bytes: Option<usize>) -> Self {
        let mut event = Self::new("stage.attempt.finished")
            .for_run(run_id)
            .for_stage(attempt.stage_id())
            .add_data("attempt", serde_json::json!(attempt.attempt_number()))
            .add_data("outcome", serde_json::json!(attempt.outcome()))
            .add_data("duration_ms", serde_json::json!(attempt.duration_ms()));
        if let Some(kind) = attempt.failure_kind() {
            event = event.add_data("failure_kind", serde_json::json!(kind));
        }
        if let Some(bytes) = output_bytes {
            event = event.add_data("output_bytes", serde_json::json!(bytes));
        }
        event
    }

    /// Creates a breaker transition event ("breaker.opened", "breaker.half_open", "breaker.closed").
    #[must_use]
    pub fn breaker(stage: &str, state: &str, consecutive_failures: u32) -> Self {
        Self::new(format!("breaker.{state}"))
            .for_stage(stage)
            .add_data("consecutive_failures", serde_json::json!(consecutive_failures))
    }

    /// Creates a "run.transition" event.
    #[must_use]
    pub fn transition(run_id: &str, stage: Option<&str>, from: RunStatus, to: RunStatus, sequence: u64) -> Self {
        let mut event = Self::new("run.transition")
            .for_run(run_id)
            .add_data("from", serde_json::json!(from))
            .add_data("to", serde_json::json!(to))
            .add_data("sequence", serde_json::json!(sequence));
        if let Some(stage) = stage {
            event = event.for_stage(stage);
        }
        event
    }

    /// Returns the outcome recorded on an attempt event, if any.
    #[must_use]
    pub fn outcome(&self) -> Option<AttemptOutcome> {
        self.data
            .get("outcome")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
