//! # driftsync protocol
//!
//! Wire types and codecs shared by the driftsync engine and the reference
//! sync service.
//!
//! This crate provides:
//! - `SyncableRecord` and its explicit tombstone lifecycle
//! - `ChangeRecord` (outbox row) and `WireChange` (what crosses the network)
//! - Push/pull messages with CBOR encoding
//! - The record schema registry and the type priority order
//! - The last-write-wins resolver
//! - An injectable `Clock`
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod clock;
mod conflict;
mod error;
mod messages;
mod record;
mod schema;

pub use change::{ChangeKey, ChangeRecord, ChangeStatus, Operation, WireChange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{resolve, Resolution, Versioned};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ChangeOutcome, ConflictEntry, DependencyConflictEntry, FailedChange, PullRequest,
    PullResponse, PushRequest, PushResponse, RejectReason, WireMessage,
};
pub use record::{Lifecycle, Payload, RecordId, RecordType, SyncableRecord, Timestamp, Tombstone};
pub use schema::{RecordSchema, Reference, SchemaViolation, TypeOrder};
