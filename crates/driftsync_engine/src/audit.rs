//! Audit trail of conflicts and applied remote changes.
//!
//! Entries are written into the same store transaction as the change they
//! describe, so the log never mentions a write that was rolled back. The
//! `tracing` events on the `driftsync::audit` target are emitted only after
//! the caller reports the commit.

use driftsync_protocol::{ChangeKey, SyncableRecord, Timestamp};
use driftsync_store::{AuditEntry, AuditKind, Transaction};

/// Stages audit entries for one transaction.
#[derive(Debug, Default)]
pub struct AuditLogger {
    staged: Vec<AuditEntry>,
}

impl AuditLogger {
    /// Creates an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry to the transaction's audit log.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        txn: &mut Transaction,
        at: Timestamp,
        kind: AuditKind,
        key: &ChangeKey,
        before: Option<SyncableRecord>,
        after: Option<SyncableRecord>,
        detail: impl Into<String>,
    ) -> u64 {
        let mut entry = AuditEntry {
            sequence: 0,
            at,
            kind,
            key: key.clone(),
            before,
            after,
            detail: detail.into(),
        };
        entry.sequence = txn.append_audit(entry.clone());
        let sequence = entry.sequence;
        self.staged.push(entry);
        sequence
    }

    /// Entries staged so far.
    pub fn entries(&self) -> &[AuditEntry] {
        &self.staged
    }

    /// Emits the staged entries. Call once the transaction has committed.
    pub fn committed(self) -> Vec<AuditEntry> {
        for entry in &self.staged {
            let level_warn = matches!(entry.kind, AuditKind::Rejected | AuditKind::Abandoned);
            if level_warn {
                tracing::warn!(
                    target: "driftsync::audit",
                    sequence = entry.sequence,
                    kind = entry.kind.as_str(),
                    key = %entry.key,
                    detail = %entry.detail,
                    "audit"
                );
            } else {
                tracing::info!(
                    target: "driftsync::audit",
                    sequence = entry.sequence,
                    kind = entry.kind.as_str(),
                    key = %entry.key,
                    before = ?entry.before.as_ref().map(|r| r.updated_at),
                    after = ?entry.after.as_ref().map(|r| r.updated_at),
                    "audit"
                );
            }
        }
        self.staged
    }
}
