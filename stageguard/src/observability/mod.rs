//! Observability utilities.

mod logging;
mod spans;

pub use logging::{init_logging, LogFormat, LoggingError};
pub use spans::{run_span, stage_span, SpanTimer};
