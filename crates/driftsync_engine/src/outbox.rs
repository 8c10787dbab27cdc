//! Change tracker: the write path for local mutations.
//!
//! Every local write goes through [`ChangeTracker`], which stores the record
//! and its outbox row in one transaction. A failure on either side rolls
//! back both.

use crate::error::{SyncError, SyncResult};
use driftsync_protocol::{
    ChangeKey, ChangeRecord, ChangeStatus, Clock, Payload, RecordId, RecordType, SyncableRecord,
    Timestamp,
};
use driftsync_store::{LocalStore, Tables, TicketState, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Captures local mutations into the outbox.
pub struct ChangeTracker {
    store: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    pending: watch::Sender<usize>,
}

impl ChangeTracker {
    /// Creates a tracker over `store`.
    pub fn new(store: Arc<LocalStore>, clock: Arc<dyn Clock>) -> Self {
        let initial = store.read(pending_count);
        let (pending, _) = watch::channel(initial);
        Self {
            store,
            clock,
            pending,
        }
    }

    /// Subscribes to the pending-change count.
    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    /// Writes a live record with an explicit modification time and queues it.
    ///
    /// If the record already exists locally, `updated_at` is raised to be
    /// strictly after the stored value.
    pub fn record(
        &self,
        record_type: impl Into<RecordType>,
        id: impl Into<RecordId>,
        payload: Payload,
        updated_at: Timestamp,
    ) -> SyncResult<SyncableRecord> {
        self.upsert(SyncableRecord::new(record_type, id, payload, updated_at))
    }

    /// Stores a record as given and queues it.
    pub fn upsert(&self, record: SyncableRecord) -> SyncResult<SyncableRecord> {
        let now = self.clock.now();
        self.transaction(|txn| Self::record_in(txn, record, now))
    }

    /// Writes a live record stamped with the current time and queues it.
    pub fn put(
        &self,
        record_type: impl Into<RecordType>,
        id: impl Into<RecordId>,
        payload: Payload,
    ) -> SyncResult<SyncableRecord> {
        self.record(record_type, id, payload, self.clock.now())
    }

    /// Creates a record under a freshly generated id.
    pub fn create(
        &self,
        record_type: impl Into<RecordType>,
        payload: Payload,
    ) -> SyncResult<SyncableRecord> {
        self.put(record_type, RecordId::generate(), payload)
    }

    /// Tombstones an existing record at `at` and queues the tombstone.
    ///
    /// Deleting an already deleted record is a no-op.
    pub fn soft_delete(
        &self,
        record_type: impl Into<RecordType>,
        id: impl Into<RecordId>,
        deleted_by: impl Into<String>,
        at: Timestamp,
    ) -> SyncResult<SyncableRecord> {
        let key = ChangeKey::new(record_type, id);
        let now = self.clock.now();
        let deleted_by = deleted_by.into();
        self.transaction(|txn| {
            let current = txn
                .record(&key)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(key.clone()))?;
            if current.is_deleted() {
                return Ok(current);
            }
            let at = at.max(current.updated_at.next());
            Self::record_in(txn, current.tombstoned(at, deleted_by), now)
        })
    }

    /// Runs several tracked writes as one unit and publishes the pending count
    /// after commit.
    pub fn transaction<F, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut Transaction) -> SyncResult<T>,
    {
        let value = self.store.transaction(f)?;
        self.publish();
        Ok(value)
    }

    /// Stores `record` and queues it, inside a caller-owned transaction.
    ///
    /// Re-mutating a record that is still queued replaces its outbox row but
    /// keeps the row's place in the queue; any retry ticket for it is dropped.
    pub fn record_in(
        txn: &mut Transaction,
        mut record: SyncableRecord,
        now: Timestamp,
    ) -> SyncResult<SyncableRecord> {
        let key = record.key();
        if key.id.as_str().is_empty() {
            return Err(SyncError::validation(key, "record id must not be empty"));
        }

        if let Some(existing) = txn.record(&key) {
            if existing.is_deleted() && !record.is_deleted() {
                return Err(SyncError::validation(
                    key,
                    "id belongs to a deleted record and cannot be reused",
                ));
            }
            if record.updated_at <= existing.updated_at {
                record.updated_at = existing.updated_at.next();
                if let driftsync_protocol::Lifecycle::Deleted(tombstone) = &mut record.lifecycle {
                    tombstone.deleted_at = tombstone.deleted_at.max(record.updated_at);
                }
            }
        }

        let row = match txn.change(&key) {
            Some(queued) if is_queued(queued.status) => {
                let mut row = ChangeRecord::from_record(&record, queued.sequence, queued.enqueued_at);
                row.status = ChangeStatus::Pending;
                row
            }
            _ => {
                let sequence = txn.next_sequence();
                ChangeRecord::from_record(&record, sequence, now)
            }
        };

        txn.remove_ticket(&key);
        txn.put_change(row);
        txn.put_record(record.clone());
        tracing::trace!(key = %key, updated_at = %record.updated_at, "queued local change");
        Ok(record)
    }

    /// Reads a local record.
    pub fn get(&self, key: &ChangeKey) -> Option<SyncableRecord> {
        self.store.read(|tables| tables.record(key).cloned())
    }

    /// Changes waiting to be pushed (including ones waiting on a retry).
    pub fn pending_count(&self) -> usize {
        self.store.read(pending_count)
    }

    /// Drops applied and conflicted rows acknowledged at least `window` before `now`.
    pub fn prune_applied(&self, now: Timestamp, window: Duration) -> SyncResult<usize> {
        let cutoff = now.saturating_sub(window);
        self.store.transaction(|txn| {
            let expired: Vec<ChangeKey> = txn
                .changes()
                .into_iter()
                .filter(|row| is_settled(row.status))
                .filter(|row| row.acknowledged_at.is_some_and(|at| at <= cutoff))
                .map(ChangeRecord::key)
                .collect();
            for key in &expired {
                txn.remove_change(key);
            }
            Ok::<_, SyncError>(expired.len())
        })
    }

    /// Drops audit entries older than `retention`, then the oldest entries
    /// beyond `keep_last`.
    pub fn prune_audit(
        &self,
        now: Timestamp,
        retention: Duration,
        keep_last: usize,
    ) -> SyncResult<usize> {
        let cutoff = now.saturating_sub(retention);
        let removed = self
            .store
            .transaction(|txn| Ok::<_, SyncError>(txn.prune_audit(cutoff, keep_last)))?;
        if removed > 0 {
            tracing::debug!(removed, "pruned audit log");
        }
        Ok(removed)
    }

    /// Resets rows left `in_flight` by a crash so they are pushed again.
    pub fn recover_in_flight(&self) -> SyncResult<usize> {
        let recovered = self.store.transaction(|txn| {
            let stuck: Vec<ChangeRecord> = txn
                .changes()
                .into_iter()
                .filter(|row| row.status == ChangeStatus::InFlight)
                .cloned()
                .collect();
            for mut row in stuck.iter().cloned() {
                row.status = ChangeStatus::Pending;
                txn.put_change(row);
            }
            let attempting: Vec<_> = txn
                .tables()
                .tickets()
                .filter(|t| t.state == TicketState::Attempting)
                .cloned()
                .collect();
            for mut ticket in attempting {
                ticket.state = TicketState::Scheduled;
                txn.put_ticket(ticket);
            }
            Ok::<_, SyncError>(stuck.len())
        })?;
        if recovered > 0 {
            tracing::info!(recovered, "reset in-flight changes left by an interrupted push");
        }
        self.publish();
        Ok(recovered)
    }

    /// Physically removes tombstones deleted before `older_than`.
    ///
    /// Tombstones that still have an unsettled outbox row are kept so the
    /// deletion is not lost before it reaches the server.
    pub fn purge_tombstones(&self, older_than: Timestamp) -> SyncResult<usize> {
        self.store.transaction(|txn| {
            let purgeable = purgeable_tombstones(txn.tables(), older_than);
            for key in &purgeable {
                txn.remove_record(key);
                txn.remove_change(key);
            }
            Ok::<_, SyncError>(purgeable.len())
        })
    }

    pub(crate) fn publish(&self) {
        let count = self.pending_count();
        self.pending.send_replace(count);
    }
}

/// Tombstones deleted before `older_than` whose outbox row, if any, is settled.
pub fn purgeable_tombstones(tables: &Tables, older_than: Timestamp) -> Vec<ChangeKey> {
    tables
        .records()
        .filter(|r| {
            r.lifecycle
                .tombstone()
                .is_some_and(|t| t.deleted_at < older_than)
        })
        .map(SyncableRecord::key)
        .filter(|key| tables.change(key).map_or(true, |row| is_settled(row.status)))
        .collect()
}

/// Rows that still owe the server a push.
pub(crate) fn is_queued(status: ChangeStatus) -> bool {
    matches!(
        status,
        ChangeStatus::Pending
            | ChangeStatus::InFlight
            | ChangeStatus::DependencyConflict
            | ChangeStatus::Failed
    )
}

/// Rows with a final server verdict.
pub(crate) fn is_settled(status: ChangeStatus) -> bool {
    matches!(status, ChangeStatus::Applied | ChangeStatus::Conflict)
}

/// Changes still expected to reach the server.
///
/// Failed rows count only while a live retry ticket exists; rejected or
/// abandoned ones need an operator and are reported separately.
pub fn pending_count(tables: &Tables) -> usize {
    tables
        .changes()
        .into_iter()
        .filter(|row| match row.status {
            ChangeStatus::Pending | ChangeStatus::InFlight => true,
            ChangeStatus::DependencyConflict | ChangeStatus::Failed => tables
                .ticket(&row.key())
                .is_some_and(|t| t.state != TicketState::Abandoned),
            ChangeStatus::Applied | ChangeStatus::Conflict => false,
        })
        .count()
}

/// Changes that may be pushed at `now`, in enqueue order.
pub fn due_changes(tables: &Tables, now: Timestamp) -> Vec<ChangeRecord> {
    tables
        .changes()
        .into_iter()
        .filter(|row| {
            let ticket = tables.ticket(&row.key());
            match row.status {
                ChangeStatus::Pending => ticket.map_or(true, |t| t.is_due(now)),
                ChangeStatus::DependencyConflict | ChangeStatus::Failed => {
                    ticket.is_some_and(|t| t.is_due(now))
                }
                _ => false,
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_protocol::ManualClock;
    use driftsync_store::{RetryKind, RetryTicket, StoreError};
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    fn tracker() -> (ChangeTracker, Arc<LocalStore>, Arc<ManualClock>) {
        let store = Arc::new(LocalStore::open_in_memory());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        (ChangeTracker::new(store.clone(), clock.clone()), store, clock)
    }

    #[test]
    fn record_writes_row_and_record_together() {
        let (tracker, store, _) = tracker();
        let mut pending = tracker.subscribe_pending();

        tracker
            .record("voter", "v1", payload(json!({"name": "Ada"})), Timestamp::from_millis(500))
            .unwrap();

        store.read(|tables| {
            let key = ChangeKey::new("voter", "v1");
            assert_eq!(tables.record(&key).unwrap().updated_at, Timestamp::from_millis(500));
            let row = tables.change(&key).unwrap();
            assert_eq!(row.status, ChangeStatus::Pending);
            assert_eq!(row.payload["name"], json!("Ada"));
        });
        assert_eq!(tracker.pending_count(), 1);
        assert!(pending.has_changed().unwrap());
        assert_eq!(*pending.borrow_and_update(), 1);
    }

    #[test]
    fn failed_mutation_leaves_no_queue_entry() {
        let (tracker, store, clock) = tracker();
        let result: SyncResult<()> = tracker.transaction(|txn| {
            ChangeTracker::record_in(
                txn,
                SyncableRecord::new("voter", "v1", Payload::new(), clock.now()),
                clock.now(),
            )?;
            Err(StoreError::aborted("local write failed").into())
        });

        assert!(result.is_err());
        store.read(|tables| {
            assert_eq!(tables.records().count(), 0);
            assert!(tables.changes().is_empty());
        });
    }

    #[test]
    fn updated_at_always_advances() {
        let (tracker, _, _) = tracker();
        tracker
            .record("voter", "v1", Payload::new(), Timestamp::from_millis(900))
            .unwrap();
        let second = tracker
            .record("voter", "v1", Payload::new(), Timestamp::from_millis(100))
            .unwrap();
        assert_eq!(second.updated_at, Timestamp::from_millis(901));
    }

    #[test]
    fn coalescing_keeps_queue_position_and_drops_ticket() {
        let (tracker, store, clock) = tracker();
        tracker.put("voter", "v1", Payload::new()).unwrap();
        tracker.put("voter", "v2", Payload::new()).unwrap();
        let key = ChangeKey::new("voter", "v1");

        store
            .transaction(|txn| {
                txn.put_ticket(RetryTicket {
                    change_id: key.clone(),
                    next_retry_at: Timestamp::from_millis(9_999),
                    attempt_count: 2,
                    last_error: "timeout".into(),
                    kind: RetryKind::Transient,
                    state: TicketState::Scheduled,
                });
                Ok::<_, StoreError>(())
            })
            .unwrap();

        clock.advance(Duration::from_millis(10));
        tracker
            .put("voter", "v1", payload(json!({"name": "Grace"})))
            .unwrap();

        store.read(|tables| {
            let order: Vec<String> = tables.changes().iter().map(|c| c.id.to_string()).collect();
            assert_eq!(order, vec!["v1", "v2"]);
            assert_eq!(tables.change(&key).unwrap().payload["name"], json!("Grace"));
            assert!(tables.ticket(&key).is_none());
        });
        assert_eq!(tracker.pending_count(), 2);
    }

    #[test]
    fn soft_delete_keeps_the_record() {
        let (tracker, store, clock) = tracker();
        tracker
            .put("voter", "v1", payload(json!({"name": "Ada"})))
            .unwrap();
        clock.advance(Duration::from_secs(1));

        let deleted = tracker.soft_delete("voter", "v1", "clerk-3", clock.now()).unwrap();
        assert!(deleted.is_deleted());

        store.read(|tables| {
            let key = ChangeKey::new("voter", "v1");
            let stored = tables.record(&key).unwrap();
            assert!(stored.is_deleted());
            assert_eq!(stored.payload["name"], json!("Ada"));
            assert!(tables.change(&key).unwrap().lifecycle.is_deleted());
        });
    }

    #[test]
    fn deleted_ids_are_never_reused() {
        let (tracker, _, clock) = tracker();
        tracker.put("voter", "v1", Payload::new()).unwrap();
        tracker.soft_delete("voter", "v1", "clerk", clock.now()).unwrap();

        let err = tracker.put("voter", "v1", Payload::new()).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }

    #[test]
    fn soft_delete_of_unknown_record_fails() {
        let (tracker, _, _) = tracker();
        assert!(matches!(
            tracker.soft_delete("voter", "nope", "clerk", Timestamp::ZERO),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn recover_resets_in_flight_rows() {
        let (tracker, store, _) = tracker();
        tracker.put("voter", "v1", Payload::new()).unwrap();
        let key = ChangeKey::new("voter", "v1");
        store
            .transaction(|txn| {
                let mut row = txn.change(&key).cloned().unwrap();
                row.status = ChangeStatus::InFlight;
                txn.put_change(row);
                Ok::<_, StoreError>(())
            })
            .unwrap();

        assert_eq!(tracker.recover_in_flight().unwrap(), 1);
        assert_eq!(
            store.read(|t| t.change(&key).unwrap().status),
            ChangeStatus::Pending
        );
    }

    #[test]
    fn queue_survives_restart_mid_push() {
        use driftsync_store::StoreConfig;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.cbor");
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let key = ChangeKey::new("voter", "v1");
        {
            let store = Arc::new(LocalStore::open(&path, StoreConfig::new()).unwrap());
            let tracker = ChangeTracker::new(store.clone(), clock.clone());
            tracker.put("voter", "v1", payload(json!({"name": "Ada"}))).unwrap();
            store
                .transaction(|txn| {
                    let mut row = txn.change(&key).cloned().unwrap();
                    row.status = ChangeStatus::InFlight;
                    txn.put_change(row);
                    Ok::<_, StoreError>(())
                })
                .unwrap();
        }

        let store = Arc::new(LocalStore::open(&path, StoreConfig::new()).unwrap());
        let tracker = ChangeTracker::new(store.clone(), clock);
        assert_eq!(tracker.recover_in_flight().unwrap(), 1);
        assert_eq!(tracker.pending_count(), 1);
        store.read(|t| {
            assert_eq!(t.record(&key).unwrap().payload["name"], json!("Ada"));
        });
    }

    #[test]
    fn prune_and_purge_respect_windows() {
        let (tracker, store, clock) = tracker();
        tracker.put("voter", "v1", Payload::new()).unwrap();
        tracker.soft_delete("voter", "v1", "clerk", clock.now()).unwrap();
        let key = ChangeKey::new("voter", "v1");

        // Unsettled tombstones survive a purge.
        clock.advance(Duration::from_secs(10));
        assert_eq!(tracker.purge_tombstones(clock.now()).unwrap(), 0);

        store
            .transaction(|txn| {
                let mut row = txn.change(&key).cloned().unwrap();
                row.status = ChangeStatus::Applied;
                row.acknowledged_at = Some(clock.now());
                txn.put_change(row);
                Ok::<_, StoreError>(())
            })
            .unwrap();

        assert_eq!(tracker.prune_applied(clock.now(), Duration::from_secs(60)).unwrap(), 0);
        clock.advance(Duration::from_secs(61));
        assert_eq!(tracker.prune_applied(clock.now(), Duration::from_secs(60)).unwrap(), 1);

        assert_eq!(tracker.purge_tombstones(clock.now()).unwrap(), 1);
        assert!(tracker.get(&key).is_none());
    }

    #[test]
    fn due_changes_honour_tickets() {
        let (tracker, store, clock) = tracker();
        tracker.put("voter", "v1", Payload::new()).unwrap();
        tracker.put("voter", "v2", Payload::new()).unwrap();
        tracker.put("voter", "v3", Payload::new()).unwrap();

        store
            .transaction(|txn| {
                for (id, state) in [("v2", TicketState::Scheduled), ("v3", TicketState::Abandoned)] {
                    let key = ChangeKey::new("voter", id);
                    let mut row = txn.change(&key).cloned().unwrap();
                    row.status = ChangeStatus::Failed;
                    txn.put_change(row);
                    txn.put_ticket(RetryTicket {
                        change_id: key,
                        next_retry_at: Timestamp::from_millis(5_000),
                        attempt_count: 1,
                        last_error: "timeout".into(),
                        kind: RetryKind::Transient,
                        state,
                    });
                }
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let ids = |at: i64| -> Vec<String> {
            store.read(|t| {
                due_changes(t, Timestamp::from_millis(at))
                    .iter()
                    .map(|c| c.id.to_string())
                    .collect()
            })
        };
        assert_eq!(ids(clock.now().as_millis()), vec!["v1"]);
        assert_eq!(ids(5_000), vec!["v1", "v2"]);
        assert_eq!(tracker.pending_count(), 2);
    }
}
