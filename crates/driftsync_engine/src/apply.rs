//! Applies pulled pages to the local store.

use crate::audit::AuditLogger;
use crate::error::SyncResult;
use driftsync_protocol::{
    resolve, ChangeRecord, ChangeStatus, Resolution, SyncableRecord, Timestamp,
};
use driftsync_store::{AuditKind, SyncCursor, Transaction};

/// Per-page counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Remote values written locally.
    pub applied: usize,
    /// Queued local changes superseded by a newer remote value.
    pub superseded: usize,
    /// Remote values older than the local one; the local value is re-queued.
    pub kept_local: usize,
    /// Remote values identical in time to the local one.
    pub unchanged: usize,
}

impl ApplySummary {
    /// Adds another page's counters.
    pub fn merge(&mut self, other: ApplySummary) {
        self.applied += other.applied;
        self.superseded += other.superseded;
        self.kept_local += other.kept_local;
        self.unchanged += other.unchanged;
    }

    /// Conflicts of either direction.
    pub fn conflicts(&self) -> usize {
        self.superseded + self.kept_local
    }
}

/// Writes one page of resolved remote records in a caller-owned transaction.
pub struct LocalApplier;

impl LocalApplier {
    /// Applies `records`, then stores `cursor`.
    ///
    /// Everything happens inside `txn`: if it does not commit, neither the
    /// records nor the cursor move.
    pub fn apply_page(
        txn: &mut Transaction,
        records: Vec<SyncableRecord>,
        cursor: SyncCursor,
        now: Timestamp,
        audit: &mut AuditLogger,
    ) -> SyncResult<ApplySummary> {
        let mut summary = ApplySummary::default();

        for remote in records {
            let key = remote.key();
            let local = txn.record(&key).cloned();

            match resolve(local.as_ref(), &remote) {
                Resolution::AcceptRemote => {
                    txn.put_record(remote.clone());
                    summary.applied += 1;

                    let queued = txn
                        .change(&key)
                        .filter(|row| superseded_by_remote(row.status))
                        .cloned();
                    if let Some(mut row) = queued {
                        row.status = ChangeStatus::Conflict;
                        row.acknowledged_at = Some(now);
                        txn.put_change(row);
                        txn.remove_ticket(&key);
                        summary.superseded += 1;
                        audit.record(
                            txn,
                            now,
                            AuditKind::ConflictRemoteWins,
                            &key,
                            local,
                            Some(remote),
                            "newer remote value replaced a queued local change",
                        );
                    } else {
                        audit.record(txn, now, AuditKind::RemoteApplied, &key, local, Some(remote), "");
                    }
                }
                Resolution::KeepLocal => {
                    let Some(local) = local else {
                        continue;
                    };
                    // An older log entry for a value the server already holds: the
                    // acknowledged local value, or the server value a conflict adopted.
                    let echoed = txn.change(&key).is_some_and(|row| match row.status {
                        ChangeStatus::Applied => row.updated_at >= local.updated_at,
                        ChangeStatus::Conflict => true,
                        _ => false,
                    });
                    if echoed {
                        summary.unchanged += 1;
                        continue;
                    }
                    summary.kept_local += 1;
                    let queued = txn
                        .change(&key)
                        .is_some_and(|row| crate::outbox::is_queued(row.status));
                    if !queued {
                        let sequence = txn.next_sequence();
                        txn.put_change(ChangeRecord::from_record(&local, sequence, now));
                        txn.remove_ticket(&key);
                    }
                    audit.record(
                        txn,
                        now,
                        AuditKind::ConflictLocalWins,
                        &key,
                        Some(remote),
                        Some(local),
                        if queued {
                            "local value already queued"
                        } else {
                            "local value re-queued for push"
                        },
                    );
                }
                Resolution::NoOp => summary.unchanged += 1,
            }
        }

        txn.set_cursor(cursor);
        Ok(summary)
    }
}

fn superseded_by_remote(status: ChangeStatus) -> bool {
    matches!(
        status,
        ChangeStatus::Pending | ChangeStatus::Failed | ChangeStatus::DependencyConflict
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::outbox::ChangeTracker;
    use driftsync_protocol::ChangeKey;
    use driftsync_store::LocalStore;
    use serde_json::json;

    fn record(id: &str, at: i64, name: &str) -> SyncableRecord {
        SyncableRecord::new(
            "voter",
            id,
            json!({ "name": name }).as_object().cloned().unwrap_or_default(),
            Timestamp::from_millis(at),
        )
    }

    fn apply(store: &LocalStore, page: Vec<SyncableRecord>, offset: u64) -> (ApplySummary, usize) {
        let mut audit = AuditLogger::new();
        let summary = store
            .transaction(|txn| {
                LocalApplier::apply_page(
                    txn,
                    page,
                    SyncCursor {
                        last_sync_timestamp: Timestamp::ZERO,
                        page_offset: offset,
                    },
                    Timestamp::from_millis(10_000),
                    &mut audit,
                )
            })
            .unwrap();
        (summary, audit.committed().len())
    }

    #[test]
    fn new_remote_records_are_written_and_audited() {
        let store = LocalStore::open_in_memory();
        let (summary, audited) = apply(&store, vec![record("v1", 5, "Ada")], 1);

        assert_eq!(summary.applied, 1);
        assert_eq!(audited, 1);
        store.read(|t| {
            assert_eq!(t.record(&ChangeKey::new("voter", "v1")).unwrap().payload["name"], json!("Ada"));
            assert_eq!(t.cursor().page_offset, 1);
            assert_eq!(t.audit()[0].kind, AuditKind::RemoteApplied);
            assert!(t.changes().is_empty());
        });
    }

    #[test]
    fn newer_remote_supersedes_queued_local_change() {
        let store = LocalStore::open_in_memory();
        let key = ChangeKey::new("voter", "v1");
        store
            .transaction(|txn| {
                ChangeTracker::record_in(txn, record("v1", 100, "local"), Timestamp::from_millis(100))
                    .map(|_| ())
            })
            .unwrap();

        let (summary, _) = apply(&store, vec![record("v1", 200, "remote")], 1);
        assert_eq!(summary.superseded, 1);

        store.read(|t| {
            assert_eq!(t.record(&key).unwrap().payload["name"], json!("remote"));
            assert_eq!(t.change(&key).unwrap().status, ChangeStatus::Conflict);
            let entry = &t.audit()[0];
            assert_eq!(entry.kind, AuditKind::ConflictRemoteWins);
            assert_eq!(entry.before.as_ref().unwrap().payload["name"], json!("local"));
            assert_eq!(entry.after.as_ref().unwrap().payload["name"], json!("remote"));
        });
    }

    #[test]
    fn older_remote_requeues_local_value() {
        let store = LocalStore::open_in_memory();
        let key = ChangeKey::new("voter", "v1");
        store
            .transaction(|txn| {
                txn.put_record(record("v1", 300, "local"));
                Ok::<_, SyncError>(())
            })
            .unwrap();

        let (summary, _) = apply(&store, vec![record("v1", 200, "stale")], 1);
        assert_eq!(summary.kept_local, 1);

        store.read(|t| {
            assert_eq!(t.record(&key).unwrap().payload["name"], json!("local"));
            let row = t.change(&key).unwrap();
            assert_eq!(row.status, ChangeStatus::Pending);
            assert_eq!(row.updated_at, Timestamp::from_millis(300));
            assert_eq!(t.audit()[0].kind, AuditKind::ConflictLocalWins);
        });
    }

    #[test]
    fn older_entries_of_an_acknowledged_value_are_ignored() {
        let store = LocalStore::open_in_memory();
        let key = ChangeKey::new("voter", "v1");
        store
            .transaction(|txn| {
                let local = record("v1", 300, "local");
                txn.put_record(local.clone());
                let mut row = ChangeRecord::from_record(&local, 1, Timestamp::from_millis(300));
                row.status = ChangeStatus::Applied;
                row.acknowledged_at = Some(Timestamp::from_millis(400));
                txn.put_change(row);
                Ok::<_, SyncError>(())
            })
            .unwrap();

        let (summary, audited) = apply(&store, vec![record("v1", 200, "earlier")], 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.conflicts(), 0);
        assert_eq!(audited, 0);
        store.read(|t| assert_eq!(t.change(&key).unwrap().status, ChangeStatus::Applied));
    }

    #[test]
    fn older_entries_after_a_lost_conflict_are_ignored() {
        let store = LocalStore::open_in_memory();
        let key = ChangeKey::new("voter", "v1");
        store
            .transaction(|txn| {
                let pushed = record("v1", 100, "local");
                let mut row = ChangeRecord::from_record(&pushed, 1, Timestamp::from_millis(100));
                row.status = ChangeStatus::Conflict;
                row.acknowledged_at = Some(Timestamp::from_millis(400));
                txn.put_change(row);
                txn.put_record(record("v1", 200, "server"));
                Ok::<_, SyncError>(())
            })
            .unwrap();

        let (summary, audited) = apply(
            &store,
            vec![record("v1", 150, "earlier"), record("v1", 200, "server")],
            2,
        );
        assert_eq!(summary.unchanged, 2);
        assert_eq!(summary.conflicts(), 0);
        assert_eq!(audited, 0);
        store.read(|t| {
            assert_eq!(t.record(&key).unwrap().payload["name"], json!("server"));
            assert_eq!(t.change(&key).unwrap().status, ChangeStatus::Conflict);
            assert!(t.ticket(&key).is_none());
        });
    }

    #[test]
    fn equal_timestamps_and_duplicates_are_no_ops() {
        let store = LocalStore::open_in_memory();
        apply(&store, vec![record("v1", 5, "Ada")], 1);
        let (summary, audited) = apply(&store, vec![record("v1", 5, "Ada")], 2);

        assert_eq!(summary.unchanged, 1);
        assert_eq!(audited, 0);
        store.read(|t| {
            assert_eq!(t.records().count(), 1);
            assert_eq!(t.cursor().page_offset, 2);
        });
    }

    #[test]
    fn tombstones_are_written_not_removed() {
        let store = LocalStore::open_in_memory();
        apply(&store, vec![record("v1", 5, "Ada")], 1);
        let tombstone = record("v1", 9, "Ada").tombstoned(Timestamp::from_millis(9), "clerk");
        apply(&store, vec![tombstone], 2);

        store.read(|t| {
            let stored = t.record(&ChangeKey::new("voter", "v1")).unwrap();
            assert!(stored.is_deleted());
            assert_eq!(stored.payload.get("name"), Some(&json!("Ada")));
        });
    }

    #[test]
    fn failed_page_leaves_cursor_and_records() {
        let store = LocalStore::open_in_memory();
        let mut audit = AuditLogger::new();
        let result: SyncResult<()> = store.transaction(|txn| {
            LocalApplier::apply_page(
                txn,
                vec![record("v1", 5, "Ada")],
                SyncCursor {
                    last_sync_timestamp: Timestamp::ZERO,
                    page_offset: 1,
                },
                Timestamp::from_millis(1),
                &mut audit,
            )?;
            Err(SyncError::Cancelled)
        });

        assert!(result.is_err());
        store.read(|t| {
            assert_eq!(t.records().count(), 0);
            assert_eq!(t.cursor().page_offset, 0);
            assert!(t.audit().is_empty());
        });
    }
}
