//! Core domain model types for stageguard.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Run status and attempt outcome enums
//! - Stage attempt records
//! - Structured engine events

mod attempt;
mod event;
mod status;

pub use attempt::{OpenAttempt, StageAttempt};
pub use event::EngineEvent;
pub use status::{AttemptOutcome, RunStatus};
