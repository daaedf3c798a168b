//! Testing utilities for stageguard workflows.
//!
//! This module provides:
//! - Scripted stage collaborators with call recording
//! - A checkpoint store that fails chosen writes

mod collaborators;
mod store;

pub use collaborators::{ScriptedCollaborator, ScriptedReply};
pub use store::FlakyCheckpointStore;
