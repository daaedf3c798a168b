//! Span helpers shared by the supervisor and executor.

use std::time::Instant;
use tracing::{info_span, Span};

/// Span covering one drive of a run.
#[must_use]
pub fn run_span(run_id: &str, workflow: &str) -> Span {
    info_span!("run", run_id = %run_id, workflow = %workflow)
}

/// Span covering one stage dispatch.
#[must_use]
pub fn stage_span(run_id: &str, stage: &str, invocation: u32) -> Span {
    info_span!("stage", run_id = %run_id, stage = %stage, invocation)
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}
