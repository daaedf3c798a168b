//! File-backed checkpoint store.
//!
//! Layout: `<root>/<run_id>/<sequence:020>.json`. Each file holds two lines:
//! the SHA-256 hex digest of the payload, then the JSON payload. A write
//! goes to a hidden temp file that is fsynced and renamed into place, so a
//! reader sees either the previous checkpoint or the new one, never a
//! partial file.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{check_run_id, Checkpoint, CheckpointStore, DEFAULT_KEEP_HISTORY};
use crate::errors::StorageError;

const EXTENSION: &str = "json";

/// Stores checkpoints as files, one directory per run.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    keep_history: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep_history: DEFAULT_KEEP_HISTORY,
            locks: DashMap::new(),
        }
    }

    /// Sets how many checkpoints are retained per run.
    #[must_use]
    pub fn with_keep_history(mut self, keep_history: usize) -> Self {
        self.keep_history = keep_history.max(1);
        self
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }
}

fn io_error(run_id: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        run_id: run_id.to_string(),
        source,
    }
}

fn checkpoint_file(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("{sequence:020}.{EXTENSION}"))
}

/// Retained sequences in a run directory, ascending. Temp files are ignored.
fn list_sequences(dir: &Path, run_id: &str) -> Result<Vec<u64>, StorageError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut sequences = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(run_id))? {
        let path = entry.map_err(io_error(run_id))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        if let Some(sequence) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            sequences.push(sequence);
        }
    }
    sequences.sort_unstable();
    Ok(sequences)
}

fn encode(checkpoint: &Checkpoint) -> Result<Vec<u8>, StorageError> {
    let payload = serde_json::to_vec(checkpoint).map_err(|e| StorageError::Serialization {
        run_id: checkpoint.run_id.clone(),
        message: e.to_string(),
    })?;
    let digest = hex::encode(Sha256::digest(&payload));
    let mut bytes = Vec::with_capacity(digest.len() + payload.len() + 2);
    bytes.extend_from_slice(digest.as_bytes());
    bytes.push(b'\n');
    bytes.extend_from_slice(&payload);
    bytes.push(b'\n');
    Ok(bytes)
}

fn decode(run_id: &str, bytes: &[u8]) -> Result<Checkpoint, StorageError> {
    let corrupt = |detail: &str| StorageError::Corrupt {
        run_id: run_id.to_string(),
        detail: detail.to_string(),
    };
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt("missing digest line"))?;
    let (digest, rest) = bytes.split_at(split);
    let payload = rest[1..].strip_suffix(b"\n").unwrap_or(&rest[1..]);

    let expected = std::str::from_utf8(digest).map_err(|_| corrupt("digest is not utf-8"))?;
    if hex::encode(Sha256::digest(payload)) != expected {
        return Err(corrupt("digest mismatch"));
    }

    let checkpoint: Checkpoint =
        serde_json::from_slice(payload).map_err(|e| StorageError::Serialization {
            run_id: run_id.to_string(),
            message: e.to_string(),
        })?;
    if checkpoint.run_id != run_id {
        return Err(corrupt("checkpoint belongs to another run"));
    }
    Ok(checkpoint)
}

fn write_atomic(
    dir: &Path,
    run_id: &str,
    sequence: u64,
    bytes: &[u8],
    keep_history: usize,
) -> Result<(), StorageError> {
    fs::create_dir_all(dir).map_err(io_error(run_id))?;

    let existing = list_sequences(dir, run_id)?;
    if let Some(&latest) = existing.last() {
        if sequence <= latest {
            return Err(StorageError::SequenceConflict {
                run_id: run_id.to_string(),
                latest,
                attempted: sequence,
            });
        }
    }

    let target = checkpoint_file(dir, sequence);
    let tmp = dir.join(format!(".{sequence:020}.{EXTENSION}.tmp"));
    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &target)?;
        #[cfg(unix)]
        File::open(dir)?.sync_all()?;
        Ok(())
    })();
    if let Err(e) = written {
        if tmp.exists() {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                warn!(run_id, error = %cleanup, "Failed to remove temp checkpoint");
            }
        }
        return Err(io_error(run_id)(e));
    }

    let mut retained = existing;
    retained.push(sequence);
    let excess = retained.len().saturating_sub(keep_history);
    for old in &retained[..excess] {
        if let Err(e) = fs::remove_file(checkpoint_file(dir, *old)) {
            warn!(run_id, sequence = old, error = %e, "Failed to prune checkpoint");
        }
    }
    Ok(())
}

fn read_latest(dir: &Path, run_id: &str) -> Result<Checkpoint, StorageError> {
    let latest = list_sequences(dir, run_id)?
        .last()
        .copied()
        .ok_or_else(|| StorageError::NotFound {
            run_id: run_id.to_string(),
        })?;
    let bytes = fs::read(checkpoint_file(dir, latest)).map_err(io_error(run_id))?;
    let checkpoint = decode(run_id, &bytes)?;
    if checkpoint.sequence != latest {
        return Err(StorageError::Corrupt {
            run_id: run_id.to_string(),
            detail: format!(
                "file sequence {latest} does not match payload sequence {}",
                checkpoint.sequence
            ),
        });
    }
    Ok(checkpoint)
}

async fn blocking<T, F>(run_id: &str, f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        StorageError::Unavailable(format!("checkpoint task for run '{run_id}' failed: {e}"))
    })?
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let run_id = checkpoint.run_id.clone();
        check_run_id(&run_id)?;
        let bytes = encode(checkpoint)?;
        let sequence = checkpoint.sequence;
        let dir = self.run_dir(&run_id);
        let keep_history = self.keep_history;

        let lock = self.lock_for(&run_id);
        let _guard = lock.lock().await;
        let id = run_id.clone();
        blocking(&run_id, move || {
            write_atomic(&dir, &id, sequence, &bytes, keep_history)
        })
        .await?;
        debug!(run_id = %run_id, sequence, "Checkpoint written");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Checkpoint, StorageError> {
        check_run_id(run_id)?;
        let dir = self.run_dir(run_id);
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        let id = run_id.to_string();
        blocking(run_id, move || read_latest(&dir, &id)).await
    }

    async fn list_runs(&self) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        blocking("*", move || {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut runs = Vec::new();
            for entry in fs::read_dir(&root).map_err(io_error("*"))? {
                let path = entry.map_err(io_error("*"))?.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if path.is_dir()
                    && check_run_id(name).is_ok()
                    && !list_sequences(&path, name)?.is_empty()
                {
                    runs.push(name.to_string());
                }
            }
            runs.sort();
            Ok(runs)
        })
        .await
    }

    async fn sequences(&self, run_id: &str) -> Result<Vec<u64>, StorageError> {
        check_run_id(run_id)?;
        let dir = self.run_dir(run_id);
        let id = run_id.to_string();
        blocking(run_id, move || list_sequences(&dir, &id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BreakerSnapshot, BreakerState};
    use crate::workflow::WorkflowRun;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn checkpoint(run_id: &str, sequence: u64) -> Checkpoint {
        let mut run = WorkflowRun::new(run_id, "wf", "a", json!({"ratio": 0.1, "seq": sequence}));
        run.record_completed("a", json!({"score": 1.0 / 3.0}));
        run.sequence = sequence;
        Checkpoint::capture(
            &run,
            vec![BreakerSnapshot {
                stage_id: "a".to_string(),
                state: BreakerState::Open,
                consecutive_failures: 5,
                opened_at: Some(chrono::Utc::now()),
            }],
        )
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let saved = checkpoint("run-1", 1);
        store.save(&saved).await.unwrap();

        let loaded = store.load("run-1").await.unwrap();
        assert_eq!(loaded, saved);
        assert!(dir.path().join("run-1").join(format!("{:020}.json", 1)).exists());
    }

    #[tokio::test]
    async fn test_loads_latest_and_rejects_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&checkpoint("r", 1)).await.unwrap();
        store.save(&checkpoint("r", 2)).await.unwrap();

        let err = store.save(&checkpoint("r", 2)).await.unwrap_err();
        assert!(matches!(err, StorageError::SequenceConflict { latest: 2, .. }));
        assert_eq!(store.load("r").await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_prunes_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).with_keep_history(3);
        for seq in 1..=6 {
            store.save(&checkpoint("r", seq)).await.unwrap();
        }
        assert_eq!(store.sequences("r").await.unwrap(), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&checkpoint("r", 1)).await.unwrap();

        let path = dir.path().join("r").join(format!("{:020}.json", 1));
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("\"wf\"", "\"xx\"")).unwrap();

        let err = store.load("r").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_ignores_leftover_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&checkpoint("r", 1)).await.unwrap();
        fs::write(
            dir.path().join("r").join(format!(".{:020}.json.tmp", 2)),
            b"partial",
        )
        .unwrap();

        assert_eq!(store.load("r").await.unwrap().sequence, 1);
        assert_eq!(store.sequences("r").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_not_found_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nested"));
        assert!(store.load("nobody").await.unwrap_err().is_not_found());
        assert!(store.list_runs().await.unwrap().is_empty());

        store.save(&checkpoint("b", 1)).await.unwrap();
        store.save(&checkpoint("a", 1)).await.unwrap();
        assert_eq!(store.list_runs().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(matches!(
            store.load("../etc").await,
            Err(StorageError::InvalidRunId { .. })
        ));
    }
}
