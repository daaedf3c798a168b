//! Open-request bookkeeping shared by the approval gate and the escalation
//! manager: at most one open request per run, each answered at most once.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::PauseOutcome;
use crate::cancellation::CancellationToken;
use crate::errors::HitlError;

struct Entry<R, S> {
    run_id: String,
    request: R,
    response_tx: Option<oneshot::Sender<S>>,
}

/// Receives the answer to one open request.
#[derive(Debug)]
pub(crate) struct Waiter<S> {
    request_id: Uuid,
    rx: oneshot::Receiver<S>,
}

pub(crate) struct PendingRegistry<R, S> {
    entries: RwLock<HashMap<Uuid, Entry<R, S>>>,
}

impl<R, S> Default for PendingRegistry<R, S> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<R: Clone, S> PendingRegistry<R, S> {
    /// Registers a request. Fails if the run already has a different open request.
    pub(crate) fn open(&self, request_id: Uuid, run_id: &str, request: R) -> Result<Waiter<S>, HitlError> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.write();
        if let Some((existing, _)) = entries
            .iter()
            .find(|(id, entry)| entry.run_id == run_id && **id != request_id)
        {
            return Err(HitlError::RequestAlreadyOpen {
                run_id: run_id.to_string(),
                request_id: existing.to_string(),
            });
        }
        entries.insert(
            request_id,
            Entry {
                run_id: run_id.to_string(),
                request,
                response_tx: Some(tx),
            },
        );
        Ok(Waiter { request_id, rx })
    }

    /// Validates and delivers a response, closing the request.
    ///
    /// An invalid response leaves the request open.
    pub(crate) fn answer(
        &self,
        request_id: Uuid,
        response: S,
        validate: impl FnOnce(&R, &S) -> Result<(), HitlError>,
    ) -> Result<(), HitlError> {
        let unknown = || HitlError::UnknownRequest {
            request_id: request_id.to_string(),
        };
        let mut entries = self.entries.write();
        let entry = entries.get(&request_id).ok_or_else(unknown)?;
        validate(&entry.request, &response)?;
        let tx = entries
            .remove(&request_id)
            .and_then(|mut entry| entry.response_tx.take())
            .ok_or_else(unknown)?;
        tx.send(response).map_err(|_| unknown())
    }

    /// Closes a request without an answer.
    pub(crate) fn withdraw(&self, request_id: Uuid) -> bool {
        self.entries.write().remove(&request_id).is_some()
    }

    /// Snapshot of every open request.
    pub(crate) fn requests(&self) -> Vec<R> {
        self.entries.read().values().map(|e| e.request.clone()).collect()
    }

    /// The open request for a run, if any.
    pub(crate) fn for_run(&self, run_id: &str) -> Option<R> {
        self.entries
            .read()
            .values()
            .find(|e| e.run_id == run_id)
            .map(|e| e.request.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Waits for the answer, the timeout, or cancellation, whichever is first.
    pub(crate) async fn wait(
        &self,
        waiter: Waiter<S>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        default: impl FnOnce() -> S,
    ) -> PauseOutcome<S> {
        let Waiter { request_id, rx } = waiter;
        let answered = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, rx).await.ok(),
                None => Some(rx.await),
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.withdraw(request_id);
                PauseOutcome::Cancelled
            }
            result = answered => match result {
                Some(Ok(response)) => PauseOutcome::Responded(response),
                Some(Err(_)) => {
                    self.withdraw(request_id);
                    PauseOutcome::Cancelled
                }
                None => {
                    self.withdraw(request_id);
                    PauseOutcome::DefaultApplied(default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_open_request_per_run() {
        let registry: PendingRegistry<String, bool> = PendingRegistry::default();
        let first = Uuid::new_v4();
        let _waiter = registry.open(first, "r1", "a".to_string()).unwrap();
        let err = registry.open(Uuid::new_v4(), "r1", "b".to_string()).unwrap_err();
        assert!(matches!(err, HitlError::RequestAlreadyOpen { .. }));
        assert!(registry.open(Uuid::new_v4(), "r2", "c".to_string()).is_ok());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.for_run("r1").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_answer_delivers_once() {
        let registry: PendingRegistry<(), u8> = PendingRegistry::default();
        let id = Uuid::new_v4();
        let waiter = registry.open(id, "r1", ()).unwrap();
        registry.answer(id, 7, |_, _| Ok(())).unwrap();
        assert!(registry.answer(id, 8, |_, _| Ok(())).is_err());

        let outcome = registry
            .wait(waiter, None, &CancellationToken::new(), || 0)
            .await;
        assert_eq!(outcome, PauseOutcome::Responded(7));
    }

    #[tokio::test]
    async fn test_invalid_answer_keeps_request_open() {
        let registry: PendingRegistry<(), u8> = PendingRegistry::default();
        let id = Uuid::new_v4();
        let _waiter = registry.open(id, "r1", ()).unwrap();
        let err = registry
            .answer(id, 1, |_, _| Err(HitlError::MissingTarget))
            .unwrap_err();
        assert_eq!(err, HitlError::MissingTarget);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_default() {
        let registry: PendingRegistry<(), u8> = PendingRegistry::default();
        let id = Uuid::new_v4();
        let waiter = registry.open(id, "r1", ()).unwrap();
        let outcome = registry
            .wait(waiter, Some(Duration::from_secs(30)), &CancellationToken::new(), || 9)
            .await;
        assert_eq!(outcome, PauseOutcome::DefaultApplied(9));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_withdraws() {
        let registry: PendingRegistry<(), u8> = PendingRegistry::default();
        let id = Uuid::new_v4();
        let waiter = registry.open(id, "r1", ()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel("shutdown");
        let outcome = registry.wait(waiter, None, &cancel, || 0).await;
        assert_eq!(outcome, PauseOutcome::Cancelled);
        assert_eq!(registry.len(), 0);
    }
}
