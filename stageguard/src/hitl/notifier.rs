//! Operator notification channels.

use tokio::sync::mpsc;
use tracing::warn;

use super::{ApprovalNotice, EscalationNotice};

/// Receives approval notices.
///
/// Called after the paused state is durable, so a notice never refers to a
/// request that a crash could lose.
#[cfg_attr(test, mockall::automock)]
pub trait ApprovalNotifier: Send + Sync {
    /// Publishes a notice.
    fn approval_requested(&self, notice: &ApprovalNotice);
}

/// Receives escalation notices.
#[cfg_attr(test, mockall::automock)]
pub trait EscalationNotifier: Send + Sync {
    /// Publishes a notice.
    fn escalation_requested(&self, notice: &EscalationNotice);
}

/// Discards every notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

impl ApprovalNotifier for NoOpNotifier {
    fn approval_requested(&self, _notice: &ApprovalNotice) {}
}

impl EscalationNotifier for NoOpNotifier {
    fn escalation_requested(&self, _notice: &EscalationNotice) {}
}

/// Forwards notices to tokio channels.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    approvals: mpsc::UnboundedSender<ApprovalNotice>,
    escalations: mpsc::UnboundedSender<EscalationNotice>,
}

/// The receiving ends of a [`ChannelNotifier`].
#[derive(Debug)]
pub struct NoticeReceivers {
    /// Approval notices.
    pub approvals: mpsc::UnboundedReceiver<ApprovalNotice>,
    /// Escalation notices.
    pub escalations: mpsc::UnboundedReceiver<EscalationNotice>,
}

impl ChannelNotifier {
    /// Creates a notifier and its receivers.
    #[must_use]
    pub fn new() -> (Self, NoticeReceivers) {
        let (approvals_tx, approvals_rx) = mpsc::unbounded_channel();
        let (escalations_tx, escalations_rx) = mpsc::unbounded_channel();
        (
            Self {
                approvals: approvals_tx,
                escalations: escalations_tx,
            },
            NoticeReceivers {
                approvals: approvals_rx,
                escalations: escalations_rx,
            },
        )
    }
}

impl ApprovalNotifier for ChannelNotifier {
    fn approval_requested(&self, notice: &ApprovalNotice) {
        if self.approvals.send(notice.clone()).is_err() {
            warn!(request_id = %notice.request_id, "Approval notice dropped, receiver closed");
        }
    }
}

impl EscalationNotifier for ChannelNotifier {
    fn escalation_requested(&self, notice: &EscalationNotice) {
        if self.escalations.send(notice.clone()).is_err() {
            warn!(request_id = %notice.request_id, "Escalation notice dropped, receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::{ApprovalRequest, EscalationReason, EscalationRequest};
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_notifier_forwards() {
        let (notifier, mut receivers) = ChannelNotifier::new();
        let approval = ApprovalRequest::new("r1", "design", json!({"draft": true}), None);
        let escalation =
            EscalationRequest::new("r1", "verify", EscalationReason::CircuitOpen, "open", Vec::new());

        notifier.approval_requested(&approval.notice());
        notifier.escalation_requested(&escalation.notice());

        assert_eq!(
            receivers.approvals.recv().await.unwrap().request_id,
            approval.request_id
        );
        assert_eq!(
            receivers.escalations.recv().await.unwrap().reason,
            EscalationReason::CircuitOpen
        );
    }

    #[test]
    fn test_closed_receiver_does_not_panic() {
        let (notifier, receivers) = ChannelNotifier::new();
        drop(receivers);
        let approval = ApprovalRequest::new("r1", "design", json!(null), None);
        notifier.approval_requested(&approval.notice());
        NoOpNotifier.approval_requested(&approval.notice());
    }
}
