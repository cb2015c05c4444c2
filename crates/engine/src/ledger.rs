//! Operation result ledger. One per attempt, written only by the coordinator.
//! Readers get immutable snapshots swapped in after every write, plus an epoch
//! channel to wait on.

use std::sync::Arc;

use arc_swap::ArcSwap;
use kairo_core::{OperationPhase, OperationResult};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("operation already finished as {0:?}")]
    AlreadyTerminal(OperationPhase),
    #[error("cannot finish an operation as Running")]
    NotTerminal,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub id: String,
    pub epoch: u64,
    pub phase: OperationPhase,
    pub message: String,
    pub started: i64,
    pub finished: Option<i64>,
    /// The attempt is blocked on pruned objects going away, which finalizers may
    /// hold indefinitely.
    pub awaiting_deletion: bool,
    pub entries: Vec<OperationResult>,
}

impl LedgerSnapshot {
    /// Entry count; this is the externally visible numbering.
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn entries(&self) -> &[OperationResult] { &self.entries }
    pub fn phase(&self) -> OperationPhase { self.phase }
    pub fn message(&self) -> &str { &self.message }

    /// Last entry recorded for kind/name.
    pub fn latest(&self, kind: &str, name: &str) -> Option<&OperationResult> {
        self.entries.iter().rev().find(|e| e.resource.is(kind, name))
    }
}

/// Read side of a ledger. Cheap to clone.
#[derive(Clone)]
pub struct LedgerReader {
    snap: Arc<ArcSwap<LedgerSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl LedgerReader {
    pub fn current(&self) -> Arc<LedgerSnapshot> { self.snap.load_full() }
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Resolve once the phase is terminal. A ledger dropped while Running resolves
    /// with its last snapshot.
    pub async fn wait_terminal(&self) -> Arc<LedgerSnapshot> {
        let mut rx = self.epoch_rx.clone();
        loop {
            let s = self.current();
            if s.phase.is_terminal() {
                return s;
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }

    /// Like [`wait_terminal`](Self::wait_terminal), but also resolves while Running
    /// once the attempt is only waiting for deletions to finish.
    pub async fn wait_settled(&self) -> Arc<LedgerSnapshot> {
        let mut rx = self.epoch_rx.clone();
        loop {
            let s = self.current();
            if s.phase.is_terminal() || s.awaiting_deletion {
                return s;
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }
}

pub struct Ledger {
    state: LedgerSnapshot,
    snap: Arc<ArcSwap<LedgerSnapshot>>,
    epoch_tx: watch::Sender<u64>,
}

impl Ledger {
    pub fn new(id: &str, started: i64) -> (Self, LedgerReader) {
        let state = LedgerSnapshot {
            id: id.to_string(),
            epoch: 0,
            phase: OperationPhase::Running,
            message: String::new(),
            started,
            finished: None,
            awaiting_deletion: false,
            entries: Vec::new(),
        };
        let snap = Arc::new(ArcSwap::from_pointee(state.clone()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let reader = LedgerReader { snap: Arc::clone(&snap), epoch_rx };
        (Self { state, snap, epoch_tx }, reader)
    }

    pub fn len(&self) -> usize { self.state.entries.len() }
    pub fn is_empty(&self) -> bool { self.state.entries.is_empty() }
    pub fn phase(&self) -> OperationPhase { self.state.phase }
    pub fn message(&self) -> &str { &self.state.message }
    pub fn entries(&self) -> &[OperationResult] { &self.state.entries }
    pub fn latest(&self, kind: &str, name: &str) -> Option<&OperationResult> { self.state.latest(kind, name) }

    fn check_open(&self) -> Result<(), LedgerError> {
        if self.state.phase.is_terminal() {
            return Err(LedgerError::AlreadyTerminal(self.state.phase));
        }
        Ok(())
    }

    fn publish(&mut self) {
        self.state.epoch = self.state.epoch.saturating_add(1);
        self.snap.store(Arc::new(self.state.clone()));
        let _ = self.epoch_tx.send(self.state.epoch);
    }

    /// Append one result; returns the entry count after the append.
    pub fn append(&mut self, result: OperationResult) -> Result<usize, LedgerError> {
        self.check_open()?;
        self.state.awaiting_deletion = false;
        self.state.entries.push(result);
        self.publish();
        Ok(self.state.entries.len())
    }

    /// Progress message while Running.
    pub fn set_message(&mut self, message: impl Into<String>) -> Result<(), LedgerError> {
        self.check_open()?;
        let message = message.into();
        if message != self.state.message || self.state.awaiting_deletion {
            self.state.message = message;
            self.state.awaiting_deletion = false;
            self.publish();
        }
        Ok(())
    }

    /// Progress message for a wait on deletions that may never end on its own.
    pub fn await_deletion(&mut self, message: impl Into<String>) -> Result<(), LedgerError> {
        self.check_open()?;
        let message = message.into();
        if message != self.state.message || !self.state.awaiting_deletion {
            self.state.message = message;
            self.state.awaiting_deletion = true;
            self.publish();
        }
        Ok(())
    }

    pub fn finish(&mut self, phase: OperationPhase, message: impl Into<String>, finished: i64) -> Result<(), LedgerError> {
        self.check_open()?;
        if !phase.is_terminal() {
            return Err(LedgerError::NotTerminal);
        }
        self.state.phase = phase;
        self.state.awaiting_deletion = false;
        self.state.message = message.into();
        self.state.finished = Some(finished);
        self.publish();
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<LedgerSnapshot> { self.snap.load_full() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kairo_core::{OperationKind, ResourceRef, ResultCode};

    fn result(name: &str, code: ResultCode) -> OperationResult {
        OperationResult {
            resource: ResourceRef::new("", "ConfigMap", Some("ns"), name),
            operation: OperationKind::Create,
            code,
            message: String::new(),
            wave: 0,
            hook_phase: None,
            attempts: 1,
            ts: 0,
        }
    }

    #[test]
    fn append_publishes_and_terminal_is_final() {
        let (mut ledger, reader) = Ledger::new("op-1", 0);
        assert_eq!(ledger.append(result("a", ResultCode::SyncFailed)).unwrap(), 1);
        assert_eq!(ledger.append(result("a", ResultCode::Synced)).unwrap(), 2);
        let snap = reader.current();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.latest("ConfigMap", "a").map(|r| r.code), Some(ResultCode::Synced));
        assert!(snap.latest("ConfigMap", "b").is_none());

        assert_eq!(ledger.finish(OperationPhase::Running, "", 1), Err(LedgerError::NotTerminal));
        ledger.finish(OperationPhase::Failed, "boom", 1).unwrap();
        assert_eq!(
            ledger.finish(OperationPhase::Succeeded, "", 2),
            Err(LedgerError::AlreadyTerminal(OperationPhase::Failed))
        );
        assert!(ledger.append(result("c", ResultCode::Synced)).is_err());
        assert_eq!(ledger.set_message("late"), Err(LedgerError::AlreadyTerminal(OperationPhase::Failed)));
        assert!(ledger.await_deletion("late").is_err());
        assert_eq!(reader.current().phase(), OperationPhase::Failed);
        assert_eq!(reader.current().message(), "boom");
    }

    #[tokio::test]
    async fn wait_terminal_wakes_on_finish() {
        let (mut ledger, reader) = Ledger::new("op-2", 0);
        let waiter = tokio::spawn(async move { reader.wait_terminal().await });
        ledger.append(result("a", ResultCode::Synced)).unwrap();
        ledger.finish(OperationPhase::Succeeded, "done", 1).unwrap();
        let snap = waiter.await.unwrap();
        assert_eq!(snap.phase, OperationPhase::Succeeded);
        assert_eq!(snap.len(), 1);
    }

    #[tokio::test]
    async fn wait_settled_wakes_on_deletion_wait() {
        let (mut ledger, reader) = Ledger::new("op-3", 0);
        let settled = reader.clone();
        let waiter = tokio::spawn(async move { settled.wait_settled().await });
        ledger.set_message("health gate waiting").unwrap();
        ledger.await_deletion("waiting for deletion of pod/a").unwrap();
        let snap = waiter.await.unwrap();
        assert_eq!(snap.phase, OperationPhase::Running);
        assert!(snap.awaiting_deletion);
        assert_eq!(snap.message, "waiting for deletion of pod/a");

        ledger.append(result("b", ResultCode::Pruned)).unwrap();
        assert!(!reader.current().awaiting_deletion);
        ledger.await_deletion("waiting for deletion of pod/a").unwrap();
        ledger.finish(OperationPhase::Succeeded, "done", 1).unwrap();
        assert!(!reader.current().awaiting_deletion);
    }
}
