//! Queued changes and their wire representation.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{Lifecycle, Payload, RecordId, RecordType, SyncableRecord, Timestamp, Tombstone};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a record: `(type, id)`.
///
/// Used as the outbox key and as the retry ticket's change id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeKey {
    /// Record kind.
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Record identifier.
    pub id: RecordId,
}

impl ChangeKey {
    /// Creates a key.
    pub fn new(record_type: impl Into<RecordType>, id: impl Into<RecordId>) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.id)
    }
}

/// Wire operation. Deletes travel as upserts carrying a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create, update or soft-delete.
    #[default]
    Upsert,
}

/// Queue state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Waiting to be pushed.
    Pending,
    /// Part of a batch currently on the wire.
    InFlight,
    /// Accepted by the server.
    Applied,
    /// Rejected because the server holds a value at least as new.
    Conflict,
    /// Rejected because a referenced parent does not exist remotely yet.
    DependencyConflict,
    /// Failed (transient failure awaiting retry, or rejected as invalid).
    Failed,
}

impl ChangeStatus {
    /// Returns the lowercase name used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::InFlight => "in_flight",
            ChangeStatus::Applied => "applied",
            ChangeStatus::Conflict => "conflict",
            ChangeStatus::DependencyConflict => "dependency_conflict",
            ChangeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued local mutation (an outbox row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Record kind.
    pub record_type: RecordType,
    /// Record identifier.
    pub id: RecordId,
    /// Always `Upsert`.
    pub operation: Operation,
    /// Field map at the time of the mutation.
    pub payload: Payload,
    /// Modification time of the mutation.
    pub updated_at: Timestamp,
    /// Live or tombstoned.
    pub lifecycle: Lifecycle,
    /// Queue state.
    pub status: ChangeStatus,
    /// Enqueue order. Stable when the same record is mutated again.
    pub sequence: u64,
    /// When the row was first enqueued.
    pub enqueued_at: Timestamp,
    /// When the server acknowledged the change (set with `Applied`).
    pub acknowledged_at: Option<Timestamp>,
}

impl ChangeRecord {
    /// Builds a pending outbox row from a record.
    pub fn from_record(record: &SyncableRecord, sequence: u64, enqueued_at: Timestamp) -> Self {
        Self {
            record_type: record.record_type.clone(),
            id: record.id.clone(),
            operation: Operation::Upsert,
            payload: record.payload.clone(),
            updated_at: record.updated_at,
            lifecycle: record.lifecycle.clone(),
            status: ChangeStatus::Pending,
            sequence,
            enqueued_at,
            acknowledged_at: None,
        }
    }

    /// Returns the row's key.
    pub fn key(&self) -> ChangeKey {
        ChangeKey::new(self.record_type.clone(), self.id.clone())
    }

    /// Returns the record value this change carries.
    pub fn to_record(&self) -> SyncableRecord {
        SyncableRecord {
            record_type: self.record_type.clone(),
            id: self.id.clone(),
            payload: self.payload.clone(),
            updated_at: self.updated_at,
            lifecycle: self.lifecycle.clone(),
        }
    }

    /// Returns the wire form of this change.
    pub fn to_wire(&self) -> WireChange {
        WireChange::from_record(&self.to_record())
    }
}

/// A change as it travels in push requests and pull responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChange {
    /// Record kind.
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Record identifier.
    pub id: RecordId,
    /// Always `upsert`.
    #[serde(default)]
    pub operation: Operation,
    /// Field map.
    #[serde(default)]
    pub payload: Payload,
    /// Modification time.
    pub updated_at: Timestamp,
    /// Tombstone timestamp, when deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,
    /// Tombstone author, when deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

impl WireChange {
    /// Builds the wire form of a record.
    pub fn from_record(record: &SyncableRecord) -> Self {
        let (deleted_at, deleted_by) = match &record.lifecycle {
            Lifecycle::Live => (None, None),
            Lifecycle::Deleted(t) => (Some(t.deleted_at), Some(t.deleted_by.clone())),
        };
        Self {
            record_type: record.record_type.clone(),
            id: record.id.clone(),
            operation: Operation::Upsert,
            payload: record.payload.clone(),
            updated_at: record.updated_at,
            deleted_at,
            deleted_by,
        }
    }

    /// Returns the change's key.
    pub fn key(&self) -> ChangeKey {
        ChangeKey::new(self.record_type.clone(), self.id.clone())
    }

    /// Interprets the tombstone fields.
    ///
    /// A `deleted_by` without `deleted_at` is rejected; a `deleted_at` without
    /// an author is accepted with an empty author.
    pub fn lifecycle(&self) -> ProtocolResult<Lifecycle> {
        match (&self.deleted_at, &self.deleted_by) {
            (None, None) => Ok(Lifecycle::Live),
            (Some(at), by) => Ok(Lifecycle::Deleted(Tombstone {
                deleted_at: *at,
                deleted_by: by.clone().unwrap_or_default(),
            })),
            (None, Some(_)) => Err(ProtocolError::invalid_change(
                self.key(),
                "deleted_by without deleted_at",
            )),
        }
    }

    /// Converts into a record, validating the tombstone fields.
    pub fn to_record(&self) -> ProtocolResult<SyncableRecord> {
        Ok(SyncableRecord {
            record_type: self.record_type.clone(),
            id: self.id.clone(),
            payload: self.payload.clone(),
            updated_at: self.updated_at,
            lifecycle: self.lifecycle()?,
        })
    }

    /// Size of this change in CBOR bytes.
    pub fn encoded_size(&self) -> ProtocolResult<usize> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf.len())
    }
}
