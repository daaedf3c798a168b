//! Event sink system for observability.
//!
//! Every transition, stage attempt, breaker transition, checkpoint and
//! approval/escalation event is handed to an injected [`EventSink`]. The
//! engine never reads events back.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
