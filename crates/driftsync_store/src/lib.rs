//! # driftsync store
//!
//! Embedded transactional store used by the driftsync engine.
//!
//! This crate provides:
//! - Local records (live and tombstoned)
//! - The outbox of queued changes
//! - The pull cursor, retry tickets and the audit log
//! - All-or-nothing transactions across every table
//! - Optional file persistence (atomic CBOR snapshots behind a lock file)
//!
//! A local mutation and its outbox entry are written in the same
//! [`Transaction`]; either both become visible or neither does.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod model;
mod snapshot;
mod store;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use model::{
    AuditEntry, AuditKind, RetryKind, RetryTicket, SyncCursor, Tables, TicketState,
};
pub use store::{LocalStore, Transaction};
