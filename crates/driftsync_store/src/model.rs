//! Rows held by the store.

use driftsync_protocol::{ChangeKey, ChangeRecord, SyncableRecord, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Pull progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Changes stored remotely after this time have not been fully pulled.
    pub last_sync_timestamp: Timestamp,
    /// Changes already applied within the current `since` window.
    pub page_offset: u64,
}

/// Why a retry ticket exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    /// Network failure or timeout.
    Transient,
    /// A parent record was missing remotely.
    Dependency,
}

impl fmt::Display for RetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryKind::Transient => "transient",
            RetryKind::Dependency => "dependency",
        })
    }
}

/// Where a retry ticket is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    /// Waiting for `next_retry_at`.
    Scheduled,
    /// Included in a push currently on the wire.
    Attempting,
    /// Gave up after too many attempts; needs an operator.
    Abandoned,
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TicketState::Scheduled => "scheduled",
            TicketState::Attempting => "attempting",
            TicketState::Abandoned => "abandoned",
        })
    }
}

/// Retry bookkeeping for one failed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTicket {
    /// The change being retried.
    pub change_id: ChangeKey,
    /// Earliest time of the next attempt.
    pub next_retry_at: Timestamp,
    /// Failed attempts so far.
    pub attempt_count: u32,
    /// Message of the most recent failure.
    pub last_error: String,
    /// Failure class.
    pub kind: RetryKind,
    /// Lifecycle state.
    pub state: TicketState,
}

impl RetryTicket {
    /// Whether the ticket may be attempted at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.state == TicketState::Scheduled && self.next_retry_at <= now
    }
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A newer remote value replaced a local one that was still queued, or
    /// the server refused a push because it holds a newer value.
    ConflictRemoteWins,
    /// A stale remote value was ignored in favour of the local one.
    ConflictLocalWins,
    /// A push was blocked on missing parents.
    DependencyConflict,
    /// A remote change was applied locally.
    RemoteApplied,
    /// A change was refused as invalid.
    Rejected,
    /// A change ran out of retries.
    Abandoned,
}

impl AuditKind {
    /// Returns the snake_case name used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::ConflictRemoteWins => "conflict_remote_wins",
            AuditKind::ConflictLocalWins => "conflict_local_wins",
            AuditKind::DependencyConflict => "dependency_conflict",
            AuditKind::RemoteApplied => "remote_applied",
            AuditKind::Rejected => "rejected",
            AuditKind::Abandoned => "abandoned",
        }
    }

    /// Whether the entry describes a conflict of either kind.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AuditKind::ConflictRemoteWins
                | AuditKind::ConflictLocalWins
                | AuditKind::DependencyConflict
        )
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, assigned on append.
    pub sequence: u64,
    /// When the event happened.
    pub at: Timestamp,
    /// What happened.
    pub kind: AuditKind,
    /// The record involved.
    pub key: ChangeKey,
    /// Value before the event, if any.
    pub before: Option<SyncableRecord>,
    /// Value after the event, if any.
    pub after: Option<SyncableRecord>,
    /// Free-form context (server message, missing parents, ...).
    pub detail: String,
}

/// In-memory contents of the store.
///
/// Readers get a shared reference through [`LocalStore::read`](crate::LocalStore::read);
/// writers go through a [`Transaction`](crate::Transaction).
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub(crate) records: BTreeMap<ChangeKey, SyncableRecord>,
    pub(crate) outbox: BTreeMap<ChangeKey, ChangeRecord>,
    pub(crate) tickets: BTreeMap<ChangeKey, RetryTicket>,
    pub(crate) cursor: Option<SyncCursor>,
    pub(crate) audit: Vec<AuditEntry>,
    pub(crate) next_sequence: u64,
    pub(crate) audit_sequence: u64,
}

impl Tables {
    /// Looks up a local record.
    pub fn record(&self, key: &ChangeKey) -> Option<&SyncableRecord> {
        self.records.get(key)
    }

    /// All local records, tombstones included, ordered by key.
    pub fn records(&self) -> impl Iterator<Item = &SyncableRecord> {
        self.records.values()
    }

    /// Looks up an outbox row.
    pub fn change(&self, key: &ChangeKey) -> Option<&ChangeRecord> {
        self.outbox.get(key)
    }

    /// Outbox rows in enqueue order.
    pub fn changes(&self) -> Vec<&ChangeRecord> {
        let mut rows: Vec<&ChangeRecord> = self.outbox.values().collect();
        rows.sort_by_key(|row| row.sequence);
        rows
    }

    /// Looks up a retry ticket.
    pub fn ticket(&self, key: &ChangeKey) -> Option<&RetryTicket> {
        self.tickets.get(key)
    }

    /// All retry tickets, ordered by change key.
    pub fn tickets(&self) -> impl Iterator<Item = &RetryTicket> {
        self.tickets.values()
    }

    /// The pull cursor; the zero cursor before the first successful pull.
    pub fn cursor(&self) -> SyncCursor {
        self.cursor.unwrap_or_default()
    }

    /// Whether a pull has ever stored a cursor.
    pub fn has_cursor(&self) -> bool {
        self.cursor.is_some()
    }

    /// The audit log, oldest first.
    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }
}
