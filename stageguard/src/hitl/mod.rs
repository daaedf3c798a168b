//! Human-in-the-loop: the approval gate, the escalation manager and the
//! channels that carry their notices to operators.
//!
//! Both pause points follow the same discipline: at most one open request
//! per run, every request answered at most once, and an optional timeout
//! that applies a configured default.

mod approval;
mod escalation;
mod notifier;
mod pending;
mod request;

pub use approval::{ApprovalConfig, ApprovalGate};
pub use escalation::{EscalationConfig, EscalationManager};
#[cfg(test)]
pub use notifier::{MockApprovalNotifier, MockEscalationNotifier};
pub use notifier::{
    ApprovalNotifier, ChannelNotifier, EscalationNotifier, NoOpNotifier, NoticeReceivers,
};
pub use request::{
    ApprovalDecision, ApprovalNotice, ApprovalRequest, ApprovalResponse, EscalationNotice,
    EscalationReason, EscalationRequest, EscalationResolution, EscalationResponse, PauseOutcome,
};
