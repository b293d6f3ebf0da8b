//! Approval waits for gated tool calls
//!
//! A gated call registers its invocation id, publishes an approval request,
//! then waits. Exactly one of approve, reject, timeout or cancellation decides
//! the wait; a resolution that races a timeout is honored if it got in first.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How an approval wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

/// Process-wide table of calls waiting for a human decision
#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<bool>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a wait for `execution_id`
    ///
    /// Register before publishing the approval request so a fast resolver
    /// cannot miss it. Dropping the returned handle withdraws the request.
    pub fn register(&self, execution_id: &str) -> PendingApproval<'_> {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(execution_id.to_string(), tx).is_some() {
            tracing::warn!(execution_id = %execution_id, "Replacing existing approval wait");
        }
        PendingApproval {
            gate: self,
            execution_id: execution_id.to_string(),
            rx,
        }
    }

    /// Deliver a human decision; returns false if nothing was waiting
    pub fn resolve(&self, execution_id: &str, approved: bool) -> bool {
        let Some(tx) = self.lock().remove(execution_id) else {
            tracing::debug!(execution_id = %execution_id, "No pending approval to resolve");
            return false;
        };
        // The waiter may have been dropped between the removal and the send.
        tx.send(approved).is_ok()
    }

    pub fn is_pending(&self, execution_id: &str) -> bool {
        self.lock().contains_key(execution_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

/// A registered approval wait
pub struct PendingApproval<'a> {
    gate: &'a ApprovalGate,
    execution_id: String,
    rx: oneshot::Receiver<bool>,
}

impl PendingApproval<'_> {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Block until a decision, the timeout, or cancellation
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> ApprovalOutcome {
        let outcome = tokio::select! {
            biased;
            decision = &mut self.rx => return decision_outcome(decision),
            _ = cancel.cancelled() => ApprovalOutcome::Cancelled,
            _ = tokio::time::sleep(timeout) => ApprovalOutcome::TimedOut,
        };

        // Withdraw the request. If a resolver already took it, its decision wins.
        if self.gate.lock().remove(&self.execution_id).is_none() {
            if let Ok(decision) = self.rx.try_recv() {
                return decision_outcome(Ok(decision));
            }
        }
        outcome
    }
}

fn decision_outcome(decision: Result<bool, oneshot::error::RecvError>) -> ApprovalOutcome {
    match decision {
        Ok(true) => ApprovalOutcome::Approved,
        Ok(false) => ApprovalOutcome::Rejected,
        Err(_) => ApprovalOutcome::Cancelled,
    }
}

impl Drop for PendingApproval<'_> {
    fn drop(&mut self) {
        self.gate.lock().remove(&self.execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_approve_and_reject() {
        let gate = Arc::new(ApprovalGate::new());
        let cancel = CancellationToken::new();

        let pending = gate.register("inv-1");
        assert!(gate.is_pending("inv-1"));
        assert!(gate.resolve("inv-1", true));
        assert_eq!(
            pending.wait(Duration::from_secs(5), &cancel).await,
            ApprovalOutcome::Approved
        );

        let pending = gate.register("inv-2");
        assert!(gate.resolve("inv-2", false));
        assert_eq!(
            pending.wait(Duration::from_secs(5), &cancel).await,
            ApprovalOutcome::Rejected
        );
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_withdraws_request() {
        let gate = ApprovalGate::new();
        let cancel = CancellationToken::new();

        let pending = gate.register("inv-1");
        let outcome = pending.wait(Duration::from_millis(1), &cancel).await;
        assert_eq!(outcome, ApprovalOutcome::TimedOut);

        // A late decision finds nothing to resolve
        assert!(!gate.is_pending("inv-1"));
        assert!(!gate.resolve("inv-1", true));
    }

    #[tokio::test]
    async fn test_cancellation_ends_wait() {
        let gate = Arc::new(ApprovalGate::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.register("inv-1")
                    .wait(Duration::from_secs(300), &cancel)
                    .await
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), ApprovalOutcome::Cancelled);
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_wait_is_withdrawn() {
        let gate = ApprovalGate::new();
        {
            let _pending = gate.register("inv-1");
            assert_eq!(gate.pending_count(), 1);
        }
        assert_eq!(gate.pending_count(), 0);
        assert!(!gate.resolve("inv-1", true));
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let gate = ApprovalGate::new();
        assert!(!gate.resolve("inv-missing", true));
    }
}
