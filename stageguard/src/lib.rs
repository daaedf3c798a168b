//! # Stageguard
//!
//! A resilient workflow-orchestration engine that drives a sequence of
//! stages, each backed by an unreliable external collaborator, toward a
//! composite goal.
//!
//! Stageguard provides:
//!
//! - **Failure isolation**: classified failures, retry with backoff, and
//!   per-stage circuit breakers shared across runs
//! - **Crash recovery**: a checkpoint after every transition, resumable
//!   without redoing completed stages
//! - **Human in the loop**: approval gates after designated stages and
//!   escalation when automated recovery is exhausted
//! - **Routing as data**: each stage decides the next step through a pure
//!   function over the immutable run state
//! - **Cancellation**: a run-level token observed at every suspension point
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stageguard::prelude::*;
//!
//! let workflow = WorkflowBuilder::new("feature")
//!     .stage(StageDefinition::new("research", research).routing(Routing::next("design")))
//!     .stage(StageDefinition::new("design", design).routing(Routing::approve_then("implement")))
//!     .stage(StageDefinition::new("implement", implement).routing(Routing::terminal()))
//!     .entry("research")
//!     .build()?;
//!
//! let supervisor = Supervisor::builder(EngineConfig::default()).build()?;
//! let run = supervisor.start(&workflow, json!({"goal": "ship it"}), &CancellationToken::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod hitl;
pub mod observability;
pub mod resilience;
pub mod testing;
pub mod utils;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{
        Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    };
    pub use crate::config::EngineConfig;
    pub use crate::core::{AttemptOutcome, EngineEvent, RunStatus, StageAttempt};
    pub use crate::errors::{
        CancellationError, EngineError, ExecutionError, PermanentError, StageFailure,
        StorageError, TransientError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::hitl::{
        ApprovalDecision, ApprovalGate, ApprovalResponse, EscalationManager,
        EscalationResolution, EscalationResponse,
    };
    pub use crate::resilience::{
        BreakerRegistry, CircuitBreaker, FailureClass, FailureClassifier, StageExecutor,
    };
    pub use crate::workflow::{
        FnCollaborator, Route, Routing, StageCall, StageCollaborator, StageDefinition,
        StageInput, Supervisor, WorkflowBuilder, WorkflowDefinition, WorkflowRun,
    };
}
