//! In-memory checkpoint store.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{check_run_id, Checkpoint, CheckpointStore, DEFAULT_KEEP_HISTORY};
use crate::errors::StorageError;

/// Keeps checkpoints in process memory. Useful for tests and for
/// deployments that accept losing runs on restart.
#[derive(Debug)]
pub struct InMemoryCheckpointStore {
    runs: DashMap<String, Vec<Checkpoint>>,
    keep_history: usize,
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(DEFAULT_KEEP_HISTORY)
    }

    /// Creates a store retaining `keep_history` checkpoints per run.
    #[must_use]
    pub fn with_history(keep_history: usize) -> Self {
        Self {
            runs: DashMap::new(),
            keep_history: keep_history.max(1),
        }
    }

    /// Number of checkpoints saved for a run and still retained.
    #[must_use]
    pub fn checkpoint_count(&self, run_id: &str) -> usize {
        self.runs.get(run_id).map_or(0, |history| history.len())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        check_run_id(&checkpoint.run_id)?;
        // The entry guard holds the shard lock: per-run exclusion.
        let mut history = self.runs.entry(checkpoint.run_id.clone()).or_default();
        if let Some(latest) = history.last() {
            if checkpoint.sequence <= latest.sequence {
                return Err(StorageError::SequenceConflict {
                    run_id: checkpoint.run_id.clone(),
                    latest: latest.sequence,
                    attempted: checkpoint.sequence,
                });
            }
        }
        history.push(checkpoint.clone());
        let excess = history.len().saturating_sub(self.keep_history);
        history.drain(..excess);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Checkpoint, StorageError> {
        check_run_id(run_id)?;
        self.runs
            .get(run_id)
            .and_then(|history| history.last().cloned())
            .ok_or_else(|| StorageError::NotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn list_runs(&self) -> Result<Vec<String>, StorageError> {
        let mut runs: Vec<String> = self
            .runs
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        runs.sort();
        Ok(runs)
    }

    async fn sequences(&self, run_id: &str) -> Result<Vec<u64>, StorageError> {
        check_run_id(run_id)?;
        Ok(self
            .runs
            .get(run_id)
            .map(|history| history.iter().map(|c| c.sequence).collect())
            .unwrap_or_default())
    }
}
