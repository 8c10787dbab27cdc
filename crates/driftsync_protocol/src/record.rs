//! Syncable records and their building blocks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque field map carried by every record.
///
/// Shape is only checked at the push/pull edge, against a [`RecordSchema`](crate::RecordSchema).
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Tag identifying the kind of a record (`"voter"`, `"tally_line"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordType(String);

impl RecordType {
    /// Creates a record type tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for RecordType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-generated, globally unique record identifier.
///
/// Ids are stable across push and pull and are never reused once a record
/// has been tombstoned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random (v4 UUID) identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wall-clock timestamp in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The epoch itself; used as the "never synced" cursor.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds since the epoch.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns milliseconds since the epoch.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Reads the system clock.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    /// Returns this timestamp moved forward by `duration`, saturating.
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Returns this timestamp moved back by `duration`, saturating.
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let delta = self.0.saturating_sub(earlier.0);
        Duration::from_millis(u64::try_from(delta).unwrap_or(0))
    }

    /// The smallest timestamp strictly after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Soft-delete marker retained on a record instead of removing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// When the record was deleted.
    pub deleted_at: Timestamp,
    /// Who deleted it (user or device identifier).
    pub deleted_by: String,
}

/// Lifecycle state of a record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// The record is alive.
    #[default]
    Live,
    /// The record has been soft-deleted.
    Deleted(Tombstone),
}

impl Lifecycle {
    /// Returns the tombstone, if the record is deleted.
    pub fn tombstone(&self) -> Option<&Tombstone> {
        match self {
            Lifecycle::Live => None,
            Lifecycle::Deleted(tombstone) => Some(tombstone),
        }
    }

    /// Returns true for deleted records.
    pub fn is_deleted(&self) -> bool {
        matches!(self, Lifecycle::Deleted(_))
    }
}

/// A generic entity participating in synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    /// Record kind.
    pub record_type: RecordType,
    /// Stable identifier.
    pub id: RecordId,
    /// Field map.
    pub payload: Payload,
    /// Last modification time; advances on every local or remote write.
    pub updated_at: Timestamp,
    /// Live or tombstoned.
    pub lifecycle: Lifecycle,
}

impl SyncableRecord {
    /// Creates a live record.
    pub fn new(
        record_type: impl Into<RecordType>,
        id: impl Into<RecordId>,
        payload: Payload,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
            payload,
            updated_at,
            lifecycle: Lifecycle::Live,
        }
    }

    /// Returns a tombstoned copy of this record, keeping its payload.
    pub fn tombstoned(mut self, deleted_at: Timestamp, deleted_by: impl Into<String>) -> Self {
        self.updated_at = deleted_at;
        self.lifecycle = Lifecycle::Deleted(Tombstone {
            deleted_at,
            deleted_by: deleted_by.into(),
        });
        self
    }

    /// Returns true if the record carries a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.lifecycle.is_deleted()
    }

    /// Returns the outbox / storage key of this record.
    pub fn key(&self) -> crate::ChangeKey {
        crate::ChangeKey::new(self.record_type.clone(), self.id.clone())
    }

    /// Returns true if both records hold the same value (ignoring nothing but identity).
    pub fn same_value(&self, other: &SyncableRecord) -> bool {
        self.updated_at == other.updated_at
            && self.payload == other.payload
            && self.lifecycle == other.lifecycle
    }
}
