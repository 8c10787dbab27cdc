//! File persistence tests for the local store.

use driftsync_protocol::{ChangeKey, ChangeRecord, Payload, SyncableRecord, Timestamp};
use driftsync_store::{
    LocalStore, RetryKind, RetryTicket, StoreConfig, StoreError, SyncCursor, TicketState,
};
use serde_json::json;
use tempfile::tempdir;

fn voter(id: &str, at: i64) -> SyncableRecord {
    SyncableRecord::new(
        "voter",
        id,
        json!({"name": "Ada"}).as_object().cloned().unwrap_or_else(Payload::new),
        Timestamp::from_millis(at),
    )
}

#[test]
fn reopen_restores_all_tables() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("client.db");
    let key = ChangeKey::new("voter", "v1");

    {
        let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
        store
            .transaction(|txn| {
                let rec = voter("v1", 10).tombstoned(Timestamp::from_millis(20), "clerk");
                let seq = txn.next_sequence();
                txn.put_change(ChangeRecord::from_record(&rec, seq, Timestamp::from_millis(20)));
                txn.put_record(rec);
                txn.put_ticket(RetryTicket {
                    change_id: key.clone(),
                    next_retry_at: Timestamp::from_millis(500),
                    attempt_count: 2,
                    last_error: "connection refused".into(),
                    kind: RetryKind::Transient,
                    state: TicketState::Scheduled,
                });
                txn.set_cursor(SyncCursor {
                    last_sync_timestamp: Timestamp::from_millis(7),
                    page_offset: 100,
                });
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
    store.read(|tables| {
        let rec = tables.record(&key).unwrap();
        assert!(rec.is_deleted());
        assert_eq!(tables.changes().len(), 1);
        assert_eq!(tables.ticket(&key).unwrap().attempt_count, 2);
        assert_eq!(tables.cursor().page_offset, 100);
    });

    // Sequence numbers keep counting after a reopen.
    let seq = store
        .transaction(|txn| Ok::<_, StoreError>(txn.next_sequence()))
        .unwrap();
    assert_eq!(seq, 2);
}

#[test]
fn second_open_is_locked() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("client.db");

    let _first = LocalStore::open(&path, StoreConfig::default()).unwrap();
    let second = LocalStore::open(&path, StoreConfig::default());
    assert!(matches!(second, Err(StoreError::Locked(_))));
}

#[test]
fn lock_released_on_drop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("client.db");

    {
        let _store = LocalStore::open(&path, StoreConfig::default()).unwrap();
    }
    LocalStore::open(&path, StoreConfig::default()).unwrap();
}

#[test]
fn missing_store_without_create() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.db");

    let result = LocalStore::open(&path, StoreConfig::new().create_if_missing(false));
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[test]
fn failed_transaction_leaves_file_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("client.db");

    {
        let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
        store
            .transaction(|txn| {
                txn.put_record(voter("v1", 1));
                Ok::<_, StoreError>(())
            })
            .unwrap();
        let failed: Result<(), StoreError> = store.transaction(|txn| {
            txn.put_record(voter("v2", 1));
            Err(StoreError::aborted("local write failed"))
        });
        assert!(failed.is_err());
    }

    let store = LocalStore::open(&path, StoreConfig::default()).unwrap();
    assert_eq!(store.read(|t| t.records().count()), 1);
}

#[test]
fn corrupt_snapshot_is_reported() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("client.db");
    std::fs::write(&path, b"not cbor at all").unwrap();

    let result = LocalStore::open(&path, StoreConfig::default());
    assert!(matches!(result, Err(StoreError::Decode(_))));
}
