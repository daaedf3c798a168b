//! Escalation manager: hands a run to a human when automated recovery is
//! exhausted.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::pending::{PendingRegistry, Waiter};
use super::{
    EscalationNotifier, EscalationReason, EscalationRequest, EscalationResolution,
    EscalationResponse, NoOpNotifier, PauseOutcome,
};
use crate::cancellation::CancellationToken;
use crate::errors::{ConfigError, HitlError};

/// Escalation wait policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Seconds to wait before applying `default_resolution`; `None` waits forever.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    /// Resolution applied on timeout.
    #[serde(default = "default_resolution")]
    pub default_resolution: EscalationResolution,
}

fn default_resolution() -> EscalationResolution {
    EscalationResolution::Abort
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            default_resolution: default_resolution(),
        }
    }
}

impl EscalationConfig {
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
                    "escalation.timeout_seconds must be a positive number".to_string(),
                ));
            }
        }
        if self.default_resolution == EscalationResolution::SubstituteInput {
            return Err(ConfigError::Invalid(
                "escalation.default_resolution cannot be 'substitute_input'".to_string(),
            ));
        }
        Ok(())
    }

    /// The default for an escalation, falling back to ABORT where the
    /// configured default is not allowed.
    #[must_use]
    pub fn default_for(&self, reason: EscalationReason) -> EscalationResolution {
        if reason.allows(self.default_resolution) {
            self.default_resolution
        } else {
            EscalationResolution::Abort
        }
    }
}

/// Tracks open escalations and validates resolutions.
pub struct EscalationManager {
    config: EscalationConfig,
    notifier: Arc<dyn EscalationNotifier>,
    pending: PendingRegistry<EscalationRequest, EscalationResponse>,
}

impl Default for EscalationManager {
    fn default() -> Self {
        Self::new(EscalationConfig::default())
    }
}

impl EscalationManager {
    /// Creates a manager with no notifier.
    #[must_use]
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            notifier: Arc::new(NoOpNotifier),
            pending: PendingRegistry::default(),
        }
    }

    /// Sets the notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn EscalationNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub(crate) fn open(
        &self,
        request: &EscalationRequest,
    ) -> Result<Waiter<EscalationResponse>, HitlError> {
        let waiter = self
            .pending
            .open(request.request_id, &request.run_id, request.clone())?;
        warn!(
            run_id = %request.run_id,
            stage = %request.stage_id,
            reason = %request.reason,
            attempts = request.attempt_history.len(),
            "Escalated to operator"
        );
        self.notifier.escalation_requested(&request.notice());
        Ok(waiter)
    }

    pub(crate) async fn wait(
        &self,
        waiter: Waiter<EscalationResponse>,
        request_id: Uuid,
        reason: EscalationReason,
        cancel: &CancellationToken,
    ) -> PauseOutcome<EscalationResponse> {
        let resolution = self.config.default_for(reason);
        let outcome = self
            .pending
            .wait(waiter, self.config.timeout(), cancel, || {
                EscalationResponse::new(request_id, resolution)
            })
            .await;
        if matches!(outcome, PauseOutcome::DefaultApplied(_)) {
            warn!(%request_id, %resolution, "Escalation timed out, applying default");
        }
        outcome
    }

    /// Applies an operator's resolution.
    pub fn resolve(&self, response: EscalationResponse) -> Result<(), HitlError> {
        let request_id = response.request_id;
        let resolution = response.resolution;
        self.pending.answer(request_id, response, |request, response| {
            if !request.reason.allows(response.resolution) {
                return Err(HitlError::ResolutionNotAllowed {
                    resolution: response.resolution.to_string(),
                    reason: request.reason.to_string(),
                });
            }
            if response.resolution == EscalationResolution::SubstituteInput
                && response.substitute_input.is_none()
            {
                return Err(HitlError::MissingSubstituteInput);
            }
            Ok(())
        })?;
        info!(%request_id, %resolution, "Escalation resolved");
        Ok(())
    }

    /// Every open escalation.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<EscalationRequest> {
        self.pending.requests()
    }

    /// The open escalation for a run, if any.
    #[must_use]
    pub fn pending_for_run(&self, run_id: &str) -> Option<EscalationRequest> {
        self.pending.for_run(run_id)
    }

    /// Number of open escalations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for EscalationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationManager")
            .field("config", &self.config)
            .field("pending_count", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::MockEscalationNotifier;
    use serde_json::json;

    fn escalation(reason: EscalationReason) -> EscalationRequest {
        EscalationRequest::new("r1", "verify", reason, "detail", Vec::new())
    }

    #[test]
    fn test_open_notifies_with_reason() {
        let mut notifier = MockEscalationNotifier::new();
        notifier
            .expect_escalation_requested()
            .withf(|notice| notice.reason == EscalationReason::IterationLimit)
            .times(1)
            .return_const(());
        let manager = EscalationManager::default().with_notifier(Arc::new(notifier));
        let _waiter = manager.open(&escalation(EscalationReason::IterationLimit)).unwrap();
        assert_eq!(manager.pending_count(), 1);
    }

    #[test]
    fn test_resolution_validation() {
        let manager = EscalationManager::default();
        let storage = escalation(EscalationReason::StorageFailure);
        let _waiter = manager.open(&storage).unwrap();

        assert!(matches!(
            manager.resolve(EscalationResponse::skip(storage.request_id)),
            Err(HitlError::ResolutionNotAllowed { .. })
        ));
        assert!(manager.resolve(EscalationResponse::abort(storage.request_id)).is_ok());

        let exhausted = EscalationRequest::new(
            "r2",
            "verify",
            EscalationReason::RetriesExhausted,
            "detail",
            Vec::new(),
        );
        let _waiter = manager.open(&exhausted).unwrap();
        let missing = EscalationResponse::new(exhausted.request_id, EscalationResolution::SubstituteInput);
        assert_eq!(manager.resolve(missing), Err(HitlError::MissingSubstituteInput));
        assert!(manager
            .resolve(EscalationResponse::substitute(exhausted.request_id, json!({"hint": 1})))
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_default_falls_back_to_abort() {
        let config = EscalationConfig {
            timeout_seconds: Some(5.0),
            default_resolution: EscalationResolution::Skip,
        };
        let manager = EscalationManager::new(config);
        let request = escalation(EscalationReason::StorageFailure);
        let waiter = manager.open(&request).unwrap();
        let outcome = manager
            .wait(
                waiter,
                request.request_id,
                request.reason,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(
            outcome,
            PauseOutcome::DefaultApplied(EscalationResponse::abort(request.request_id))
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(EscalationConfig::default().validate().is_ok());
        let config = EscalationConfig {
            timeout_seconds: None,
            default_resolution: EscalationResolution::SubstituteInput,
        };
        assert!(config.validate().is_err());
    }
}
