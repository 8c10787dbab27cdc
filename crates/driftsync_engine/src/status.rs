//! Status signals published to the application.

use crate::state::SyncState;
use driftsync_protocol::Timestamp;
use serde::Serialize;
use tokio::sync::watch;

/// Snapshot of what the application needs to show about syncing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Engine state.
    #[serde(serialize_with = "state_name")]
    pub state: SyncState,
    /// Whether the last network call reached the server.
    pub online: bool,
    /// Local changes not yet accepted by the server.
    pub pending_count: usize,
    /// Changes that ran out of retries and need an operator.
    pub abandoned_count: usize,
    /// End of the last successful cycle.
    pub last_sync_time: Option<Timestamp>,
    /// Most recent error, cleared by a clean cycle.
    pub last_error: Option<String>,
    /// Whether a schema mismatch stopped the loop.
    pub halted: bool,
}

fn state_name<S: serde::Serializer>(state: &SyncState, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(state.as_str())
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            online: false,
            pending_count: 0,
            abandoned_count: 0,
            last_sync_time: None,
            last_error: None,
            halted: false,
        }
    }
}

/// Owns the sending half of the status channel.
#[derive(Debug)]
pub struct StatusPublisher {
    sender: watch::Sender<SyncStatus>,
}

impl StatusPublisher {
    /// Creates a publisher with an initial status.
    pub fn new(initial: SyncStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Returns a new receiver.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.sender.subscribe()
    }

    /// Current status.
    pub fn current(&self) -> SyncStatus {
        self.sender.borrow().clone()
    }

    /// Applies `f` and notifies receivers if anything changed.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.sender.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }

    /// Sets only the state.
    pub fn set_state(&self, state: SyncState) {
        self.update(|s| s.state = state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receivers_only_wake_on_change() {
        let publisher = StatusPublisher::new(SyncStatus::default());
        let mut rx = publisher.subscribe();

        publisher.set_state(SyncState::Idle);
        assert!(!rx.has_changed().unwrap());

        publisher.update(|s| {
            s.pending_count = 3;
            s.online = true;
        });
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.pending_count, 3);
        assert!(seen.online);
        assert_eq!(publisher.current(), seen);
    }

    #[test]
    fn serializes_state_by_name() {
        let status = SyncStatus {
            state: SyncState::RetryWait,
            ..SyncStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "retry_wait");
        assert_eq!(json["pending_count"], 0);
    }
}
