//! Push and pull messages.
//!
//! Bodies travel as CBOR. Every message implements [`WireMessage`], which
//! supplies `encode` / `decode` through ciborium.

use crate::change::{ChangeKey, WireChange};
use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{RecordId, RecordType, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// CBOR encoding shared by all protocol messages.
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// Encodes to CBOR.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Client to server: a batch of changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushRequest {
    /// Changes of one batch, in send order.
    pub changes: Vec<WireChange>,
}

impl PushRequest {
    /// Creates a push request.
    pub fn new(changes: Vec<WireChange>) -> Self {
        Self { changes }
    }

    /// Bytes a request adds around its changes.
    ///
    /// The array header grows with the element count, so a few spare bytes
    /// are included.
    pub fn envelope_size() -> usize {
        PushRequest::default()
            .encode()
            .map(|bytes| bytes.len())
            .unwrap_or(0)
            + 8
    }
}

impl WireMessage for PushRequest {}

/// Why the server refused a change outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// The payload is malformed for its (known) type.
    Validation {
        /// Details.
        message: String,
    },
    /// The server does not know the record's shape at all.
    SchemaMismatch {
        /// Details.
        message: String,
    },
}

impl RejectReason {
    /// Returns the human readable message.
    pub fn message(&self) -> &str {
        match self {
            RejectReason::Validation { message } | RejectReason::SchemaMismatch { message } => {
                message
            }
        }
    }
}

/// A change refused by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedChange {
    /// Record kind.
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// Record identifier.
    pub id: RecordId,
    /// Why it was refused.
    pub reason: RejectReason,
}

impl FailedChange {
    /// Creates an entry for `key`.
    pub fn new(key: &ChangeKey, reason: RejectReason) -> Self {
        Self {
            record_type: key.record_type.clone(),
            id: key.id.clone(),
            reason,
        }
    }

    /// Returns the refused change's key.
    pub fn key(&self) -> ChangeKey {
        ChangeKey::new(self.record_type.clone(), self.id.clone())
    }
}

/// A change that lost against a value the server already holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// The conflicting change.
    pub change: ChangeKey,
    /// What the server holds.
    #[serde(default)]
    pub server_record: Option<WireChange>,
}

/// A change referencing parents the server does not have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConflictEntry {
    /// The blocked change.
    pub change: ChangeKey,
    /// Parent records that are missing remotely.
    #[serde(default)]
    pub missing: Vec<ChangeKey>,
}

/// Server to client: per-change results of a push.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushResponse {
    /// Number of changes that modified server state.
    pub processed_count: u64,
    /// Refused changes.
    #[serde(default)]
    pub failed_changes: Vec<FailedChange>,
    /// Changes that lost to a newer server value.
    #[serde(default)]
    pub conflicts: Vec<ConflictEntry>,
    /// Changes blocked on missing parents.
    #[serde(default)]
    pub dependency_conflicts: Vec<DependencyConflictEntry>,
    /// Server time at which the push was handled.
    pub server_timestamp: Timestamp,
}

impl WireMessage for PushResponse {}

/// What happened to one pushed change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// Stored (or already stored with the same value).
    Applied,
    /// The server holds a value at least as new.
    Conflict {
        /// The server's value, when reported.
        server_record: Option<WireChange>,
    },
    /// One or more parents are missing remotely.
    DependencyConflict {
        /// Missing parents.
        missing: Vec<ChangeKey>,
    },
    /// Refused outright.
    Rejected(RejectReason),
}

impl PushResponse {
    /// Pairs every sent change with its outcome.
    ///
    /// Changes the server did not mention were applied.
    pub fn outcomes(&self, sent: &[WireChange]) -> Vec<(ChangeKey, ChangeOutcome)> {
        let mut reported: HashMap<ChangeKey, ChangeOutcome> = HashMap::new();
        for entry in &self.dependency_conflicts {
            reported.insert(
                entry.change.clone(),
                ChangeOutcome::DependencyConflict {
                    missing: entry.missing.clone(),
                },
            );
        }
        for entry in &self.conflicts {
            reported.insert(
                entry.change.clone(),
                ChangeOutcome::Conflict {
                    server_record: entry.server_record.clone(),
                },
            );
        }
        for failed in &self.failed_changes {
            reported.insert(failed.key(), ChangeOutcome::Rejected(failed.reason.clone()));
        }

        sent.iter()
            .map(|change| {
                let key = change.key();
                let outcome = reported.remove(&key).unwrap_or(ChangeOutcome::Applied);
                (key, outcome)
            })
            .collect()
    }
}

/// Client to server: one pull page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Only changes stored strictly after this time.
    pub since: Timestamp,
    /// Page size.
    pub limit: u32,
    /// Changes to skip within the `since` window.
    pub offset: u64,
}

impl PullRequest {
    /// Creates a pull request.
    pub fn new(since: Timestamp, limit: u32, offset: u64) -> Self {
        Self {
            since,
            limit,
            offset,
        }
    }

    /// Renders as a URL query string (`since=..&limit=..&offset=..`).
    pub fn to_query(&self) -> String {
        format!(
            "since={}&limit={}&offset={}",
            self.since.as_millis(),
            self.limit,
            self.offset
        )
    }

    /// Parses a URL query string. Missing `since`/`offset` default to zero.
    pub fn from_query(query: &str) -> ProtocolResult<Self> {
        let mut since = 0i64;
        let mut limit = None;
        let mut offset = 0u64;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| ProtocolError::InvalidQuery(format!("malformed pair '{pair}'")))?;
            let bad = |_| ProtocolError::InvalidQuery(format!("bad value for '{name}': '{value}'"));
            match name {
                "since" => since = value.parse().map_err(bad)?,
                "limit" => limit = Some(value.parse().map_err(bad)?),
                "offset" => offset = value.parse().map_err(bad)?,
                _ => {}
            }
        }

        let limit = limit.ok_or_else(|| ProtocolError::InvalidQuery("missing limit".into()))?;
        Ok(Self::new(Timestamp::from_millis(since), limit, offset))
    }
}

/// Server to client: one page of changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changes ordered by server modification time.
    pub changes: Vec<WireChange>,
    /// Server time at which the page was produced.
    pub server_timestamp: Timestamp,
    /// Whether more changes remain after this page.
    pub has_more: bool,
}

impl WireMessage for PullResponse {}
