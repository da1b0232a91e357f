//! Sync status publishing.
//!
//! The engine owns one [`StatusPublisher`] and is the only writer. UI
//! collaborators read snapshots or hold a [`StatusReceiver`] to be woken
//! on every phase transition.

use crate::state::SyncState;
use cupnote_sync_protocol::Timestamp;
use tokio::sync::watch;

/// Process-wide sync status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Last known connectivity.
    pub is_online: bool,
    /// A pass is running.
    pub is_syncing: bool,
    /// End of the last successful pass.
    pub last_sync_time: Option<Timestamp>,
    /// Records still waiting for upload in the current pass.
    pub pending_uploads: usize,
    /// Message of the last failed pass, cleared by a successful one.
    pub error: Option<String>,
    /// Current orchestrator phase.
    pub phase: SyncState,
}

/// Holds the sync status and notifies observers of changes.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<SyncStatus>,
}

impl StatusPublisher {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { tx }
    }

    /// Returns a snapshot of the current status.
    pub fn status(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    /// Returns a read-only handle that observes future changes.
    pub fn subscribe(&self) -> StatusReceiver {
        StatusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_modify(f);
    }
}

/// Read-only view of the sync status.
#[derive(Debug, Clone)]
pub struct StatusReceiver {
    rx: watch::Receiver<SyncStatus>,
}

impl StatusReceiver {
    /// Returns the latest status.
    pub fn current(&self) -> SyncStatus {
        self.rx.borrow().clone()
    }

    /// Waits for the next change and returns it.
    ///
    /// Returns `None` once the engine has been dropped.
    pub async fn changed(&mut self) -> Option<SyncStatus> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PassOutcome;

    #[test]
    fn starts_with_defaults() {
        let publisher = StatusPublisher::new();
        let status = publisher.status();

        assert!(!status.is_online);
        assert!(!status.is_syncing);
        assert!(status.last_sync_time.is_none());
        assert_eq!(status.pending_uploads, 0);
        assert!(status.error.is_none());
        assert_eq!(status.phase, SyncState::Idle);
    }

    #[tokio::test]
    async fn receivers_observe_updates() {
        let publisher = StatusPublisher::new();
        let mut receiver = publisher.subscribe();

        publisher.update(|s| {
            s.is_syncing = true;
            s.phase = SyncState::Uploading;
        });

        let status = receiver.changed().await.unwrap();
        assert!(status.is_syncing);
        assert_eq!(status.phase, SyncState::Uploading);
        assert_eq!(receiver.current(), publisher.status());
    }

    #[tokio::test]
    async fn receiver_ends_when_publisher_drops() {
        let publisher = StatusPublisher::new();
        let mut receiver = publisher.subscribe();

        publisher.update(|s| s.phase = SyncState::Done(PassOutcome::Success));
        drop(publisher);

        assert_eq!(
            receiver.changed().await.map(|s| s.phase),
            Some(SyncState::Done(PassOutcome::Success))
        );
        assert!(receiver.changed().await.is_none());
    }
}
