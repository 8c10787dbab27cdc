//! Engine state machine and cycle bookkeeping.

use crate::pull::PullResult;
use crate::push::PushResult;
use driftsync_protocol::Timestamp;
use std::time::Duration;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is pushing queued changes to the server.
    Pushing,
    /// Engine is pulling changes from the server.
    Pulling,
    /// Engine has completed a sync cycle.
    Synced,
    /// The last cycle failed.
    Error,
    /// The last cycle hit a network failure; waiting for the next attempt.
    RetryWait,
    /// A schema mismatch stopped syncing until `resume()`.
    Halted,
    /// The background loop was stopped.
    Stopped,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pulling | SyncState::Pushing)
    }

    /// Returns true if the engine can start a new sync.
    pub fn can_start_sync(&self) -> bool {
        !matches!(
            self,
            SyncState::Pulling | SyncState::Pushing | SyncState::Halted
        )
    }

    /// Lowercase name, as shown by operators.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pushing => "pushing",
            SyncState::Pulling => "pulling",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
            SyncState::RetryWait => "retry_wait",
            SyncState::Halted => "halted",
            SyncState::Stopped => "stopped",
        }
    }
}

/// Running totals across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Cycles that ended in an error.
    pub cycles_failed: u64,
    /// Remote changes received.
    pub changes_pulled: u64,
    /// Local changes the server accepted.
    pub changes_pushed: u64,
    /// Conflicts seen on either side.
    pub conflicts_encountered: u64,
    /// Network failures that scheduled a retry.
    pub retries: u64,
    /// End of the last successful cycle.
    pub last_sync_time: Option<Timestamp>,
    /// Last error message.
    pub last_error: Option<String>,
}

impl SyncStats {
    pub(crate) fn record_success(&mut self, cycle: &SyncCycleResult, at: Timestamp) {
        self.cycles_completed += 1;
        self.changes_pulled += cycle.pull.received as u64;
        self.changes_pushed += cycle.push.applied_count() as u64;
        self.conflicts_encountered += cycle.conflicts() as u64;
        self.retries += cycle.push.transient_failures as u64;
        self.last_sync_time = Some(at);
        self.last_error = cycle.push.last_error.clone();
    }

    pub(crate) fn record_failure(&mut self, error: String) {
        self.cycles_failed += 1;
        self.last_error = Some(error);
    }
}

/// Result of a sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncCycleResult {
    /// Push phase outcome.
    pub push: PushResult,
    /// Pull phase outcome.
    pub pull: PullResult,
    /// Outbox rows pruned after the cycle.
    pub pruned: usize,
    /// Audit entries dropped by retention after the cycle.
    pub audit_pruned: usize,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    /// Conflicts resolved during the cycle, on either side.
    pub fn conflicts(&self) -> usize {
        self.push.conflict_count() + self.pull.conflicts()
    }

    /// Whether some batch hit a network failure.
    pub fn had_transient_failure(&self) -> bool {
        self.push.transient_failures > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_protocol::{ChangeKey, ChangeRecord, Payload, SyncableRecord};

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(SyncState::Synced.can_start_sync());
        assert!(SyncState::Error.can_start_sync());
        assert!(SyncState::RetryWait.can_start_sync());
        assert!(!SyncState::Pulling.can_start_sync());
        assert!(!SyncState::Pushing.can_start_sync());
        assert!(!SyncState::Halted.can_start_sync());

        assert!(SyncState::Pulling.is_active());
        assert!(SyncState::Pushing.is_active());
        assert!(!SyncState::Idle.is_active());
        assert_eq!(SyncState::RetryWait.as_str(), "retry_wait");
    }

    #[test]
    fn stats_accumulate() {
        let mut stats = SyncStats::default();
        let cycle = SyncCycleResult {
            push: PushResult {
                applied: vec![
                    ChangeKey::new("user", "u1"),
                    ChangeKey::new("user", "u2"),
                    ChangeKey::new("user", "u3"),
                ],
                conflicts: vec![ChangeRecord::from_record(
                    &SyncableRecord::new("user", "u4", Payload::new(), Timestamp::from_millis(5)),
                    4,
                    Timestamp::from_millis(5),
                )],
                transient_failures: 2,
                last_error: Some("timeout".into()),
                ..PushResult::default()
            },
            pull: PullResult {
                received: 4,
                ..PullResult::default()
            },
            ..SyncCycleResult::default()
        };

        stats.record_success(&cycle, Timestamp::from_millis(10));
        stats.record_failure("schema mismatch".into());

        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.cycles_failed, 1);
        assert_eq!(stats.changes_pushed, 3);
        assert_eq!(stats.changes_pulled, 4);
        assert_eq!(stats.conflicts_encountered, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.last_sync_time, Some(Timestamp::from_millis(10)));
        assert_eq!(stats.last_error.as_deref(), Some("schema mismatch"));
    }
}
