//! Fault-injecting checkpoint store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
use crate::errors::StorageError;

/// Wraps a store and fails chosen saves with [`StorageError::Unavailable`].
///
/// Saves are numbered from 1 in call order. Failed saves never reach the
/// inner store.
pub struct FlakyCheckpointStore {
    inner: Arc<dyn CheckpointStore>,
    fail_on: Mutex<BTreeSet<usize>>,
    fail_next: AtomicUsize,
    saves: AtomicUsize,
    failures: AtomicUsize,
}

impl Default for FlakyCheckpointStore {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryCheckpointStore::new()))
    }
}

impl FlakyCheckpointStore {
    /// Wraps `inner`. No saves fail until configured.
    #[must_use]
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Self {
        Self {
            inner,
            fail_on: Mutex::new(BTreeSet::new()),
            fail_next: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Fails the saves with these call numbers.
    #[must_use]
    pub fn failing_saves(self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.fail_on.lock().extend(calls);
        self
    }

    /// Fails the next `count` saves.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Save calls made so far, failed ones included.
    #[must_use]
    pub fn save_calls(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Saves that were failed on purpose.
    #[must_use]
    pub fn injected_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn should_fail(&self, call: usize) -> bool {
        let pending = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        pending || self.fail_on.lock().remove(&call)
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let call = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.should_fail(call) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Unavailable(format!(
                "injected failure on save {call} for run '{}'",
                checkpoint.run_id
            )));
        }
        self.inner.save(checkpoint).await
    }

    async fn load(&self, run_id: &str) -> Result<Checkpoint, StorageError> {
        self.inner.load(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list_runs().await
    }

    async fn sequences(&self, run_id: &str) -> Result<Vec<u64>, StorageError> {
        self.inner.sequences(run_id).await
    }
}

impl std::fmt::Debug for FlakyCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyCheckpointStore")
            .field("save_calls", &self.save_calls())
            .field("injected_failures", &self.injected_failures())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowRun;
    use serde_json::json;

    fn checkpoint(sequence: u64) -> Checkpoint {
        let mut run = WorkflowRun::new("r", "wf", "a", json!(null));
        run.sequence = sequence;
        Checkpoint::capture(&run, Vec::new())
    }

    #[tokio::test]
    async fn test_fails_chosen_saves() {
        let store = FlakyCheckpointStore::default().failing_saves([2]);
        assert!(store.save(&checkpoint(1)).await.is_ok());
        assert!(store.save(&checkpoint(2)).await.is_err());
        assert!(store.save(&checkpoint(2)).await.is_ok());
        assert_eq!(store.save_calls(), 3);
        assert_eq!(store.injected_failures(), 1);
        assert_eq!(store.load("r").await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let store = FlakyCheckpointStore::default();
        store.fail_next(2);
        assert!(store.save(&checkpoint(1)).await.is_err());
        assert!(store.save(&checkpoint(1)).await.is_err());
        assert!(store.save(&checkpoint(1)).await.is_ok());
    }
}
