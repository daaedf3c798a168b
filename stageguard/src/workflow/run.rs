//! The workflow run: the single mutable record a supervisor drives.
//!
//! Everything outside this crate sees a run read-only. Routing functions
//! receive `&WorkflowRun`; the supervisor mutates it only while applying a
//! transition, then checkpoints it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::StageInput;
use crate::core::{RunStatus, StageAttempt};
use crate::hitl::{ApprovalRequest, EscalationRequest};
use crate::utils::{now_utc, Timestamp};

/// What the supervisor does next with a running run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    /// Execute `stage_id`.
    Dispatch {
        /// The stage to execute.
        stage_id: String,
        /// Operator-supplied input for this dispatch only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        substitute: Option<Value>,
    },
    /// `stage_id` has a recorded result; evaluate its routing.
    Completed {
        /// The stage whose routing is due.
        stage_id: String,
    },
}

impl Cursor {
    /// The stage the cursor refers to.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        match self {
            Self::Dispatch { stage_id, .. } | Self::Completed { stage_id } => stage_id,
        }
    }
}

/// How a stage's entry in the output log came about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The collaborator returned this output.
    Completed {
        /// The stage output.
        output: Value,
    },
    /// An operator skipped the stage. Carries no output.
    Skipped {
        /// Why the stage was skipped.
        reason: String,
    },
}

/// One entry in the append-only output log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage.
    pub stage_id: String,
    /// Real output or explicit skip marker.
    pub outcome: StageOutcome,
    /// When the entry was appended.
    pub recorded_at: Timestamp,
}

impl StageResult {
    /// Returns the output if the stage really completed.
    #[must_use]
    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            StageOutcome::Completed { output } => Some(output),
            StageOutcome::Skipped { .. } => None,
        }
    }

    /// Returns true for a skip marker.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, StageOutcome::Skipped { .. })
    }
}

/// The open human request, if the run is paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingRequest {
    /// Paused at an approval gate.
    Approval(ApprovalRequest),
    /// Paused on an escalation.
    Escalation(EscalationRequest),
}

/// A workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub(crate) run_id: String,
    pub(crate) workflow: String,
    pub(crate) goal: Value,
    pub(crate) status: RunStatus,
    pub(crate) cursor: Cursor,
    #[serde(default)]
    pub(crate) results: Vec<StageResult>,
    #[serde(default)]
    pub(crate) attempts: Vec<StageAttempt>,
    #[serde(default)]
    pub(crate) approvals: Vec<ApprovalRequest>,
    #[serde(default)]
    pub(crate) escalations: Vec<EscalationRequest>,
    #[serde(default)]
    pub(crate) pending: Option<PendingRequest>,
    #[serde(default)]
    pub(crate) invocations: u32,
    #[serde(default)]
    pub(crate) sequence: u64,
    #[serde(default)]
    pub(crate) detail: Option<String>,
    pub(crate) created_at: Timestamp,
    pub(crate) updated_at: Timestamp,
}

impl WorkflowRun {
    /// Creates a run positioned at the entry stage.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        workflow: impl Into<String>,
        entry: impl Into<String>,
        goal: Value,
    ) -> Self {
        let now = now_utc();
        Self {
            run_id: run_id.into(),
            workflow: workflow.into(),
            goal,
            status: RunStatus::Running,
            cursor: Cursor::Dispatch {
                stage_id: entry.into(),
                substitute: None,
            },
            results: Vec::new(),
            attempts: Vec::new(),
            approvals: Vec::new(),
            escalations: Vec::new(),
            pending: None,
            invocations: 0,
            sequence: 0,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The workflow name.
    #[must_use]
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// The composite goal.
    #[must_use]
    pub fn goal(&self) -> &Value {
        &self.goal
    }

    /// Lifecycle status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Next action.
    #[must_use]
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// The stage the run is at.
    #[must_use]
    pub fn current_stage(&self) -> &str {
        self.cursor.stage_id()
    }

    /// The append-only output log.
    #[must_use]
    pub fn results(&self) -> &[StageResult] {
        &self.results
    }

    /// Every attempt made during the run.
    #[must_use]
    pub fn attempts(&self) -> &[StageAttempt] {
        &self.attempts
    }

    /// Attempts made for one stage.
    #[must_use]
    pub fn attempts_for(&self, stage_id: &str) -> Vec<&StageAttempt> {
        self.attempts
            .iter()
            .filter(|a| a.stage_id() == stage_id)
            .collect()
    }

    /// Closed approval requests.
    #[must_use]
    pub fn approvals(&self) -> &[ApprovalRequest] {
        &self.approvals
    }

    /// Closed escalations.
    #[must_use]
    pub fn escalations(&self) -> &[EscalationRequest] {
        &self.escalations
    }

    /// The open request while paused.
    #[must_use]
    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    /// Stage invocations counted toward the iteration cap.
    #[must_use]
    pub fn invocations(&self) -> u32 {
        self.invocations
    }

    /// Sequence number of the latest checkpoint of this run.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Why the run ended, for FAILED and ABORTED runs.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// When the run was created.
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// When the run last changed.
    #[must_use]
    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// The latest log entry for a stage, skip markers included.
    #[must_use]
    pub fn latest(&self, stage_id: &str) -> Option<&StageResult> {
        self.results.iter().rev().find(|r| r.stage_id == stage_id)
    }

    /// The latest real output of a stage. Skip markers are never returned.
    #[must_use]
    pub fn latest_output(&self, stage_id: &str) -> Option<&Value> {
        self.results
            .iter()
            .rev()
            .filter(|r| r.stage_id == stage_id)
            .find_map(StageResult::output)
    }

    /// Returns true if the stage's latest entry is a skip marker.
    #[must_use]
    pub fn was_skipped(&self, stage_id: &str) -> bool {
        self.latest(stage_id).is_some_and(StageResult::is_skipped)
    }

    /// Stages with at least one real output, in first-completion order.
    #[must_use]
    pub fn completed_stages(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for result in &self.results {
            if result.output().is_some() && !seen.contains(&result.stage_id.as_str()) {
                seen.push(&result.stage_id);
            }
        }
        seen
    }

    /// Latest real output of every stage.
    #[must_use]
    pub fn outputs(&self) -> BTreeMap<String, Value> {
        let mut outputs = BTreeMap::new();
        for result in &self.results {
            if let Some(output) = result.output() {
                outputs.insert(result.stage_id.clone(), output.clone());
            }
        }
        outputs
    }

    /// Builds the input for the next dispatch.
    #[must_use]
    pub fn stage_input(&self, substitute: Option<Value>) -> StageInput {
        StageInput {
            goal: self.goal.clone(),
            prior_outputs: self.outputs(),
            substitute,
        }
    }

    pub(crate) fn record_completed(&mut self, stage_id: &str, output: Value) {
        self.results.push(StageResult {
            stage_id: stage_id.to_string(),
            outcome: StageOutcome::Completed { output },
            recorded_at: now_utc(),
        });
        self.cursor = Cursor::Completed {
            stage_id: stage_id.to_string(),
        };
    }

    pub(crate) fn record_skipped(&mut self, stage_id: &str, reason: impl Into<String>) {
        self.results.push(StageResult {
            stage_id: stage_id.to_string(),
            outcome: StageOutcome::Skipped {
                reason: reason.into(),
            },
            recorded_at: now_utc(),
        });
        self.cursor = Cursor::Completed {
            stage_id: stage_id.to_string(),
        };
    }

    pub(crate) fn dispatch(&mut self, stage_id: impl Into<String>, substitute: Option<Value>) {
        self.status = RunStatus::Running;
        self.cursor = Cursor::Dispatch {
            stage_id: stage_id.into(),
            substitute,
        };
    }

    pub(crate) fn finish(&mut self, status: RunStatus, detail: Option<String>) {
        self.status = status;
        self.detail = detail;
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_utc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_new_run_dispatches_entry() {
        let run = WorkflowRun::new("r1", "wf", "research", json!("goal"));
        assert_eq!(run.status(), RunStatus::Running);
        assert_eq!(
            run.cursor(),
            &Cursor::Dispatch {
                stage_id: "research".to_string(),
                substitute: None
            }
        );
        assert!(run.results().is_empty());
    }

    #[test]
    fn test_skip_marker_is_distinguishable() {
        let mut run = WorkflowRun::new("r1", "wf", "a", json!(null));
        run.record_completed("a", json!({"v": 1}));
        run.record_skipped("b", "operator skipped");

        assert_eq!(run.latest_output("a"), Some(&json!({"v": 1})));
        assert_eq!(run.latest_output("b"), None);
        assert!(run.was_skipped("b"));
        assert!(run.latest("b").is_some());
        assert_eq!(run.completed_stages(), vec!["a"]);
        assert!(!run.outputs().contains_key("b"));
    }

    #[test]
    fn test_latest_output_prefers_newest_real_output() {
        let mut run = WorkflowRun::new("r1", "wf", "a", json!(null));
        run.record_completed("a", json!(1));
        run.record_completed("a", json!(2));
        run.record_skipped("a", "skip");
        assert_eq!(run.latest_output("a"), Some(&json!(2)));
        assert_eq!(run.results().len(), 3);
    }

    #[test]
    fn test_stage_input_carries_prior_outputs() {
        let mut run = WorkflowRun::new("r1", "wf", "a", json!({"goal": "ship"}));
        run.record_completed("a", json!("research notes"));
        let input = run.stage_input(Some(json!("override")));
        assert_eq!(input.goal, json!({"goal": "ship"}));
        assert_eq!(input.prior("a"), Some(&json!("research notes")));
        assert_eq!(input.substitute, Some(json!("override")));
    }

    #[test]
    fn test_run_serialization_roundtrip() {
        let mut run = WorkflowRun::new("r1", "wf", "a", json!({"n": 1.5}));
        run.record_completed("a", json!([1, 2, 3]));
        let json = serde_json::to_string(&run).unwrap();
        let back: WorkflowRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
    }
}
