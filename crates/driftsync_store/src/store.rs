//! The store and its transactions.

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::model::{AuditEntry, RetryTicket, SyncCursor, Tables};
use crate::snapshot::SnapshotFile;
use driftsync_protocol::{ChangeKey, ChangeRecord, SyncableRecord, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::path::Path;

/// Embedded transactional store.
///
/// Writers are serialized; readers never block on a running transaction
/// and only ever observe committed state.
#[derive(Debug)]
pub struct LocalStore {
    tables: RwLock<Tables>,
    commit_lock: Mutex<()>,
    file: Option<SnapshotFile>,
}

impl LocalStore {
    /// Creates an empty store that lives only in memory.
    pub fn open_in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            commit_lock: Mutex::new(()),
            file: None,
        }
    }

    /// Opens (or creates) a file-backed store.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `Locked`)
    /// - The snapshot cannot be read or decoded
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let (file, tables) = SnapshotFile::open(path.as_ref(), &config)?;
        tracing::debug!(
            path = %file.path().display(),
            records = tables.records.len(),
            outbox = tables.outbox.len(),
            "opened local store"
        );
        Ok(Self {
            tables: RwLock::new(tables),
            commit_lock: Mutex::new(()),
            file: Some(file),
        })
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(SnapshotFile::path)
    }

    /// Executes a function within a transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back if it
    /// returns `Err`. If persisting the commit fails, nothing becomes visible
    /// and the persistence error is returned.
    pub fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _writer = self.commit_lock.lock();
        let mut txn = Transaction {
            tables: self.tables.read().clone(),
            dirty: false,
        };

        let value = f(&mut txn)?;

        if txn.dirty {
            if let Some(file) = &self.file {
                file.save(&txn.tables)?;
            }
            *self.tables.write() = txn.tables;
        }
        Ok(value)
    }

    /// Runs `f` against the committed state.
    pub fn read<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&Tables) -> T,
    {
        f(&*self.tables.read())
    }
}

/// A write transaction.
///
/// Works on a private copy of the tables; the copy replaces the committed
/// state only when the owning [`LocalStore::transaction`] call succeeds.
#[derive(Debug)]
pub struct Transaction {
    tables: Tables,
    dirty: bool,
}

impl Transaction {
    /// Read access to the transaction's view.
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Looks up a local record.
    pub fn record(&self, key: &ChangeKey) -> Option<&SyncableRecord> {
        self.tables.records.get(key)
    }

    /// All local records, ordered by key.
    pub fn records(&self) -> impl Iterator<Item = &SyncableRecord> {
        self.tables.records.values()
    }

    /// Inserts or replaces a local record.
    pub fn put_record(&mut self, record: SyncableRecord) {
        self.dirty = true;
        self.tables.records.insert(record.key(), record);
    }

    /// Physically removes a local record.
    pub fn remove_record(&mut self, key: &ChangeKey) -> Option<SyncableRecord> {
        self.dirty = true;
        self.tables.records.remove(key)
    }

    /// Looks up an outbox row.
    pub fn change(&self, key: &ChangeKey) -> Option<&ChangeRecord> {
        self.tables.outbox.get(key)
    }

    /// Outbox rows in enqueue order.
    pub fn changes(&self) -> Vec<&ChangeRecord> {
        self.tables.changes()
    }

    /// Inserts or replaces an outbox row.
    pub fn put_change(&mut self, change: ChangeRecord) {
        self.dirty = true;
        self.tables.outbox.insert(change.key(), change);
    }

    /// Removes an outbox row.
    pub fn remove_change(&mut self, key: &ChangeKey) -> Option<ChangeRecord> {
        self.dirty = true;
        self.tables.outbox.remove(key)
    }

    /// Hands out the next enqueue sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.dirty = true;
        self.tables.next_sequence += 1;
        self.tables.next_sequence
    }

    /// Looks up a retry ticket.
    pub fn ticket(&self, key: &ChangeKey) -> Option<&RetryTicket> {
        self.tables.tickets.get(key)
    }

    /// Inserts or replaces a retry ticket.
    pub fn put_ticket(&mut self, ticket: RetryTicket) {
        self.dirty = true;
        self.tables.tickets.insert(ticket.change_id.clone(), ticket);
    }

    /// Removes a retry ticket.
    pub fn remove_ticket(&mut self, key: &ChangeKey) -> Option<RetryTicket> {
        self.dirty = true;
        self.tables.tickets.remove(key)
    }

    /// The pull cursor.
    pub fn cursor(&self) -> SyncCursor {
        self.tables.cursor()
    }

    /// Replaces the pull cursor.
    pub fn set_cursor(&mut self, cursor: SyncCursor) {
        self.dirty = true;
        self.tables.cursor = Some(cursor);
    }

    /// Appends to the audit log, assigning the entry's sequence.
    ///
    /// Sequences keep increasing after older entries are pruned.
    pub fn append_audit(&mut self, mut entry: AuditEntry) -> u64 {
        self.dirty = true;
        self.tables.audit_sequence += 1;
        entry.sequence = self.tables.audit_sequence;
        self.tables.audit.push(entry);
        self.tables.audit_sequence
    }

    /// Drops audit entries recorded before `older_than`, then the oldest
    /// entries beyond the newest `keep_last`. Returns how many were removed.
    pub fn prune_audit(&mut self, older_than: Timestamp, keep_last: usize) -> usize {
        let before = self.tables.audit.len();
        self.tables.audit.retain(|entry| entry.at >= older_than);
        let excess = self.tables.audit.len().saturating_sub(keep_last);
        self.tables.audit.drain(..excess);

        let removed = before - self.tables.audit.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuditKind, RetryKind, TicketState};
    use driftsync_protocol::{Payload, Timestamp};

    fn record(id: &str, at: i64) -> SyncableRecord {
        SyncableRecord::new("voter", id, Payload::new(), Timestamp::from_millis(at))
    }

    #[test]
    fn commit_makes_writes_visible() {
        let store = LocalStore::open_in_memory();
        store
            .transaction(|txn| {
                let seq = txn.next_sequence();
                let rec = record("v1", 10);
                txn.put_change(ChangeRecord::from_record(&rec, seq, Timestamp::from_millis(10)));
                txn.put_record(rec);
                Ok::<_, StoreError>(())
            })
            .unwrap();

        store.read(|tables| {
            assert!(tables.record(&ChangeKey::new("voter", "v1")).is_some());
            assert_eq!(tables.changes().len(), 1);
            assert_eq!(tables.changes()[0].sequence, 1);
        });
    }

    #[test]
    fn error_rolls_back_everything() {
        let store = LocalStore::open_in_memory();
        let result: StoreResult<()> = store.transaction(|txn| {
            txn.put_record(record("v1", 10));
            txn.set_cursor(SyncCursor {
                last_sync_timestamp: Timestamp::from_millis(5),
                page_offset: 3,
            });
            Err(StoreError::aborted("enqueue failed"))
        });

        assert!(result.is_err());
        store.read(|tables| {
            assert_eq!(tables.records().count(), 0);
            assert!(!tables.has_cursor());
        });
    }

    #[test]
    fn changes_are_listed_in_enqueue_order() {
        let store = LocalStore::open_in_memory();
        store
            .transaction(|txn| {
                for id in ["c", "a", "b"] {
                    let seq = txn.next_sequence();
                    txn.put_change(ChangeRecord::from_record(
                        &record(id, 1),
                        seq,
                        Timestamp::from_millis(1),
                    ));
                }
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let order: Vec<String> =
            store.read(|t| t.changes().iter().map(|c| c.id.to_string()).collect());
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn audit_and_tickets() {
        let store = LocalStore::open_in_memory();
        let key = ChangeKey::new("voter", "v1");
        store
            .transaction(|txn| {
                txn.put_ticket(RetryTicket {
                    change_id: key.clone(),
                    next_retry_at: Timestamp::from_millis(100),
                    attempt_count: 1,
                    last_error: "timeout".into(),
                    kind: RetryKind::Transient,
                    state: TicketState::Scheduled,
                });
                for kind in [AuditKind::RemoteApplied, AuditKind::ConflictRemoteWins] {
                    txn.append_audit(AuditEntry {
                        sequence: 0,
                        at: Timestamp::from_millis(1),
                        kind,
                        key: key.clone(),
                        before: None,
                        after: Some(record("v1", 1)),
                        detail: String::new(),
                    });
                }
                Ok::<_, StoreError>(())
            })
            .unwrap();

        store.read(|tables| {
            let ticket = tables.ticket(&key).unwrap();
            assert!(!ticket.is_due(Timestamp::from_millis(99)));
            assert!(ticket.is_due(Timestamp::from_millis(100)));
            let sequences: Vec<u64> = tables.audit().iter().map(|e| e.sequence).collect();
            assert_eq!(sequences, vec![1, 2]);
        });
    }

    #[test]
    fn audit_pruning_by_age_and_count() {
        let store = LocalStore::open_in_memory();
        let key = ChangeKey::new("voter", "v1");
        let entry = |at: i64| AuditEntry {
            sequence: 0,
            at: Timestamp::from_millis(at),
            kind: AuditKind::RemoteApplied,
            key: key.clone(),
            before: None,
            after: None,
            detail: String::new(),
        };

        let removed = store
            .transaction(|txn| {
                for at in 1..=10 {
                    txn.append_audit(entry(at * 100));
                }
                Ok::<_, StoreError>(txn.prune_audit(Timestamp::from_millis(300), 5))
            })
            .unwrap();
        // Two are too old, three more exceed the cap.
        assert_eq!(removed, 5);

        store
            .transaction(|txn| {
                assert_eq!(txn.prune_audit(Timestamp::from_millis(0), 100), 0);
                txn.append_audit(entry(2_000));
                Ok::<_, StoreError>(())
            })
            .unwrap();

        store.read(|tables| {
            let sequences: Vec<u64> = tables.audit().iter().map(|e| e.sequence).collect();
            assert_eq!(sequences, vec![6, 7, 8, 9, 10, 11]);
        });
    }
}
