//! Approval gate for human sign-off between stages.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::pending::{PendingRegistry, Waiter};
use super::{
    ApprovalDecision, ApprovalNotifier, ApprovalRequest, ApprovalResponse, NoOpNotifier,
    PauseOutcome,
};
use crate::cancellation::CancellationToken;
use crate::errors::{ConfigError, HitlError};

/// Approval wait policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Seconds to wait before applying `default_decision`; `None` waits forever.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    /// Decision applied on timeout.
    #[serde(default = "default_decision")]
    pub default_decision: ApprovalDecision,
}

fn default_decision() -> ApprovalDecision {
    ApprovalDecision::Rejected
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            default_decision: default_decision(),
        }
    }
}

impl ApprovalConfig {
    /// Returns the timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Checks the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(secs) = self.timeout_seconds {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ConfigError::Invalid(
                    "approval.timeout_seconds must be a positive number".to_string(),
                ));
            }
        }
        if self.default_decision == ApprovalDecision::Modified {
            return Err(ConfigError::Invalid(
                "approval.default_decision cannot be 'modified'".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct OpenApproval {
    request: ApprovalRequest,
    valid_targets: Vec<String>,
}

/// The pause point for approvals.
///
/// Opening a request publishes a notice; [`ApprovalGate::respond`] validates
/// an operator's answer and wakes the waiting run.
pub struct ApprovalGate {
    config: ApprovalConfig,
    notifier: Arc<dyn ApprovalNotifier>,
    pending: PendingRegistry<OpenApproval, ApprovalResponse>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(ApprovalConfig::default())
    }
}

impl ApprovalGate {
    /// Creates a gate with no notifier.
    #[must_use]
    pub fn new(config: ApprovalConfig) -> Self {
        Self {
            config,
            notifier: Arc::new(NoOpNotifier),
            pending: PendingRegistry::default(),
        }
    }

    /// Sets the notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Registers a request and notifies operators.
    ///
    /// `valid_targets` lists the stages a MODIFIED decision may name.
    pub(crate) fn open(
        &self,
        request: &ApprovalRequest,
        valid_targets: Vec<String>,
    ) -> Result<Waiter<ApprovalResponse>, HitlError> {
        let waiter = self.pending.open(
            request.request_id,
            &request.run_id,
            OpenApproval {
                request: request.clone(),
                valid_targets,
            },
        )?;
        info!(
            run_id = %request.run_id,
            stage = %request.stage_id,
            request_id = %request.request_id,
            "Approval requested"
        );
        self.notifier.approval_requested(&request.notice());
        Ok(waiter)
    }

    /// Waits for the decision. On timeout the configured default applies.
    pub(crate) async fn wait(
        &self,
        waiter: Waiter<ApprovalResponse>,
        request_id: Uuid,
        cancel: &CancellationToken,
    ) -> PauseOutcome<ApprovalResponse> {
        let decision = self.config.default_decision;
        let outcome = self
            .pending
            .wait(waiter, self.config.timeout(), cancel, || ApprovalResponse {
                request_id,
                decision,
                modified_target: None,
            })
            .await;
        if matches!(outcome, PauseOutcome::DefaultApplied(_)) {
            warn!(%request_id, %decision, "Approval timed out, applying default");
        }
        outcome
    }

    /// Applies an operator's decision.
    pub fn respond(&self, response: ApprovalResponse) -> Result<(), HitlError> {
        let request_id = response.request_id;
        self.pending.answer(request_id, response, |open, response| {
            if response.decision != ApprovalDecision::Modified {
                return Ok(());
            }
            let target = response
                .modified_target
                .as_deref()
                .ok_or(HitlError::MissingTarget)?;
            if open.valid_targets.iter().any(|t| t == target) {
                Ok(())
            } else {
                Err(HitlError::UnknownTarget {
                    target: target.to_string(),
                })
            }
        })?;
        info!(%request_id, "Approval decided");
        Ok(())
    }

    /// Every open request.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        self.pending.requests().into_iter().map(|o| o.request).collect()
    }

    /// The open request for a run, if any.
    #[must_use]
    pub fn pending_for_run(&self, run_id: &str) -> Option<ApprovalRequest> {
        self.pending.for_run(run_id).map(|o| o.request)
    }

    /// Number of open requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("config", &self.config)
            .field("pending_count", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::MockApprovalNotifier;
    use serde_json::json;

    fn request() -> ApprovalRequest {
        ApprovalRequest::new("r1", "design", json!({"plan": "v1"}), Some("build".to_string()))
    }

    fn targets() -> Vec<String> {
        vec!["research".to_string(), "design".to_string(), "build".to_string()]
    }

    #[tokio::test]
    async fn test_open_notifies_once() {
        let mut notifier = MockApprovalNotifier::new();
        notifier
            .expect_approval_requested()
            .withf(|notice| notice.stage_id == "design")
            .times(1)
            .return_const(());

        let gate = ApprovalGate::default().with_notifier(Arc::new(notifier));
        let request = request();
        let _waiter = gate.open(&request, targets()).unwrap();
        assert_eq!(gate.pending_count(), 1);
        assert_eq!(gate.pending_for_run("r1").unwrap().request_id, request.request_id);
    }

    #[tokio::test]
    async fn test_respond_wakes_waiter() {
        let gate = Arc::new(ApprovalGate::default());
        let request = request();
        let waiter = gate.open(&request, targets()).unwrap();

        let responder = gate.clone();
        let id = request.request_id;
        tokio::spawn(async move {
            responder.respond(ApprovalResponse::approve(id)).unwrap();
        });

        let outcome = gate.wait(waiter, id, &CancellationToken::new()).await;
        assert_eq!(outcome, PauseOutcome::Responded(ApprovalResponse::approve(id)));
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_modified_requires_known_target() {
        let gate = ApprovalGate::default();
        let request = request();
        let _waiter = gate.open(&request, targets()).unwrap();
        let id = request.request_id;

        let missing = ApprovalResponse {
            request_id: id,
            decision: ApprovalDecision::Modified,
            modified_target: None,
        };
        assert_eq!(gate.respond(missing), Err(HitlError::MissingTarget));
        assert!(matches!(
            gate.respond(ApprovalResponse::modify(id, "deploy")),
            Err(HitlError::UnknownTarget { .. })
        ));
        assert_eq!(gate.pending_count(), 1);
        assert!(gate.respond(ApprovalResponse::modify(id, "research")).is_ok());
    }

    #[test]
    fn test_unknown_request() {
        let gate = ApprovalGate::default();
        assert!(matches!(
            gate.respond(ApprovalResponse::approve(Uuid::new_v4())),
            Err(HitlError::UnknownRequest { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_default_decision() {
        let config = ApprovalConfig {
            timeout_seconds: Some(60.0),
            default_decision: ApprovalDecision::Approved,
        };
        let gate = ApprovalGate::new(config);
        let request = request();
        let waiter = gate.open(&request, targets()).unwrap();
        let outcome = gate
            .wait(waiter, request.request_id, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            PauseOutcome::DefaultApplied(ApprovalResponse::approve(request.request_id))
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(ApprovalConfig::default().validate().is_ok());
        let config = ApprovalConfig {
            timeout_seconds: None,
            default_decision: ApprovalDecision::Modified,
        };
        assert!(config.validate().is_err());
        let config = ApprovalConfig {
            timeout_seconds: Some(0.0),
            default_decision: ApprovalDecision::Rejected,
        };
        assert!(config.validate().is_err());
    }
}
