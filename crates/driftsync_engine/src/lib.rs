//! # driftsync engine
//!
//! Offline-first synchronization between a local [`LocalStore`] and a remote
//! authoritative service.
//!
//! This crate provides:
//! - Change tracking: every local write is queued in the outbox atomically
//!   with the write itself
//! - Dependency-ordered, size-bounded push batches
//! - Paginated pull with a crash-safe cursor
//! - Last-write-wins conflict resolution with an audit trail
//! - Retry scheduling with exponential backoff and a fixed dependency delay
//! - HTTP transport abstraction
//!
//! ## Architecture
//!
//! Each cycle is **push-then-pull**:
//! 1. Due outbox rows are sorted so parent types go first, batched and sent
//! 2. Per-change outcomes update the outbox, retry tickets and audit log
//! 3. Remote changes since the cursor are pulled page by page
//! 4. Each page is resolved and applied in one store transaction
//!
//! ## Key Invariants
//!
//! - A local write and its outbox row commit together or not at all
//! - Parents are pushed before children; a child batch is held back when
//!   its parent's batch failed in the same cycle
//! - The pull cursor only moves in the transaction that applied the page
//! - Records are never physically removed by sync; deletes are tombstones
//! - Replaying a change or a page is harmless
//!
//! [`LocalStore`]: driftsync_store::LocalStore

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod audit;
mod config;
mod engine;
mod error;
mod http;
mod outbox;
mod pull;
mod push;
mod retry;
mod sorter;
mod state;
mod status;
mod transport;

pub use apply::{ApplySummary, LocalApplier};
pub use audit::AuditLogger;
pub use config::{RetryConfig, SyncConfig};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpTransport, LoopbackClient,
    LoopbackServer, PULL_PATH, PUSH_PATH,
};
pub use outbox::{due_changes, pending_count, purgeable_tombstones, ChangeTracker};
pub use pull::{validate_page, PageStream, PullPipeline, PullResult};
pub use push::{PushPipeline, PushResult};
pub use retry::{abandoned, RetryController, RetryScheduler, TicketDisposition};
pub use sorter::{Batch, DependencySorter, SortOutput};
pub use state::{SyncCycleResult, SyncState, SyncStats};
pub use status::{StatusPublisher, SyncStatus};
pub use transport::{with_deadline, MockTransport, SyncTransport};
