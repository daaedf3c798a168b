//! Durable run snapshots.
//!
//! A [`Checkpoint`] captures a [`WorkflowRun`] together with every breaker
//! state after each transition. Stores write all-or-nothing and reject
//! sequence numbers that do not advance, so a stale writer can never
//! overwrite newer progress.

mod file;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{ConfigError, StorageError};
use crate::resilience::BreakerSnapshot;
use crate::utils::{is_valid_run_id, now_utc, Timestamp};
use crate::workflow::WorkflowRun;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;

/// Default number of checkpoints retained per run.
pub const DEFAULT_KEEP_HISTORY: usize = 10;

/// An immutable snapshot of a run and the breaker registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The run.
    pub run_id: String,
    /// Strictly increasing per run.
    pub sequence: u64,
    /// When the snapshot was taken.
    pub written_at: Timestamp,
    /// Full run state.
    pub run: WorkflowRun,
    /// Every breaker known to the process.
    #[serde(default)]
    pub breakers: Vec<BreakerSnapshot>,
}

impl Checkpoint {
    /// Captures a run at its current sequence number.
    #[must_use]
    pub fn capture(run: &WorkflowRun, breakers: Vec<BreakerSnapshot>) -> Self {
        Self {
            run_id: run.run_id().to_string(),
            sequence: run.sequence(),
            written_at: now_utc(),
            run: run.clone(),
            breakers,
        }
    }
}

/// Durable storage for checkpoints, keyed by run id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Writes a checkpoint atomically.
    ///
    /// Fails with [`StorageError::SequenceConflict`] if `checkpoint.sequence`
    /// is not greater than the latest stored sequence for the run.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    /// Loads the latest checkpoint of a run.
    async fn load(&self, run_id: &str) -> Result<Checkpoint, StorageError>;

    /// Loads the latest state of a run.
    async fn load_run(&self, run_id: &str) -> Result<WorkflowRun, StorageError> {
        Ok(self.load(run_id).await?.run)
    }

    /// Lists runs with at least one checkpoint.
    async fn list_runs(&self) -> Result<Vec<String>, StorageError>;

    /// Retained sequence numbers for a run, ascending.
    async fn sequences(&self, run_id: &str) -> Result<Vec<u64>, StorageError>;
}

/// Checkpoint store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory for the file store; `None` keeps checkpoints in memory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Checkpoints retained per run.
    #[serde(default = "default_keep_history")]
    pub keep_history: usize,
}

fn default_keep_history() -> usize {
    DEFAULT_KEEP_HISTORY
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: None,
            keep_history: default_keep_history(),
        }
    }
}

impl CheckpointConfig {
    /// Checks the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_history == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint.keep_history must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn check_run_id(run_id: &str) -> Result<(), StorageError> {
    if is_valid_run_id(run_id) {
        Ok(())
    } else {
        Err(StorageError::InvalidRunId {
            run_id: run_id.to_string(),
        })
    }
}
