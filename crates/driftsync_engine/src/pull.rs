//! Pull pipeline: pages through remote changes since the stored cursor.
//!
//! `page_offset` moves inside each page's apply transaction, so a crash in
//! the middle of a multi-page pull resumes at the first unapplied page.
//! `last_sync_timestamp` only moves once a run reaches the end of the window,
//! to the server time of that run's first page.

use crate::apply::{ApplySummary, LocalApplier};
use crate::audit::AuditLogger;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{with_deadline, SyncTransport};
use driftsync_protocol::{
    Clock, PullRequest, PullResponse, SyncableRecord, Timestamp, TypeOrder, WireChange,
};
use driftsync_store::{LocalStore, SyncCursor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lazy sequence of pull pages.
pub struct PageStream<'a> {
    transport: &'a dyn SyncTransport,
    since: Timestamp,
    offset: u64,
    limit: u32,
    pages: u32,
    max_pages: u32,
    timeout: Duration,
    done: bool,
    truncated: bool,
}

impl<'a> PageStream<'a> {
    /// Starts at `cursor`.
    pub fn new(transport: &'a dyn SyncTransport, cursor: SyncCursor, config: &SyncConfig) -> Self {
        Self {
            transport,
            since: cursor.last_sync_timestamp,
            offset: cursor.page_offset,
            limit: config.pull_page_size,
            pages: 0,
            max_pages: config.max_pull_pages,
            timeout: config.request_timeout,
            done: false,
            truncated: false,
        }
    }

    /// Fetches the next page, or `None` once the server reports no more
    /// changes or the page budget is spent.
    pub async fn next_page(&mut self) -> SyncResult<Option<PullResponse>> {
        if self.done {
            return Ok(None);
        }
        if self.pages >= self.max_pages {
            self.done = true;
            self.truncated = true;
            return Ok(None);
        }

        let request = PullRequest::new(self.since, self.limit, self.offset);
        let page = with_deadline(self.timeout, self.transport.pull(&request)).await?;
        self.pages += 1;
        self.offset += page.changes.len() as u64;
        if !page.has_more {
            self.done = true;
        } else if page.changes.is_empty() {
            return Err(SyncError::Protocol(
                "server reported more changes but sent an empty page".into(),
            ));
        }
        Ok(Some(page))
    }

    /// Whether the run stopped at the page budget with changes left.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Offset of the next page.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Aggregated outcome of one pull run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullResult {
    /// Pages applied.
    pub pages: u32,
    /// Changes received.
    pub received: usize,
    /// Per-record counters.
    pub summary: ApplySummary,
    /// Whether the page budget cut the run short.
    pub truncated: bool,
    /// Server time of the run's first page.
    pub server_timestamp: Option<Timestamp>,
}

impl PullResult {
    /// Conflicts detected while applying.
    pub fn conflicts(&self) -> usize {
        self.summary.conflicts()
    }
}

/// Retrieves and applies remote changes.
pub struct PullPipeline<'a> {
    store: &'a Arc<LocalStore>,
    transport: &'a dyn SyncTransport,
    config: &'a SyncConfig,
    clock: &'a dyn Clock,
    cancelled: &'a AtomicBool,
}

impl<'a> PullPipeline<'a> {
    /// Creates a pipeline over borrowed engine parts.
    pub fn new(
        store: &'a Arc<LocalStore>,
        transport: &'a dyn SyncTransport,
        config: &'a SyncConfig,
        clock: &'a dyn Clock,
        cancelled: &'a AtomicBool,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            clock,
            cancelled,
        }
    }

    /// Pulls from the stored cursor until the window is exhausted or the page
    /// budget is spent.
    pub async fn run(&self) -> SyncResult<PullResult> {
        let start = self.store.read(|t| t.cursor());
        let mut stream = PageStream::new(self.transport, start, self.config);
        let mut result = PullResult::default();

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }
            let Some(page) = stream.next_page().await? else {
                break;
            };

            let first = *result.server_timestamp.get_or_insert(page.server_timestamp);
            let records = validate_page(&self.config.type_order, &page.changes)?;
            let cursor = if page.has_more {
                SyncCursor {
                    last_sync_timestamp: start.last_sync_timestamp,
                    page_offset: stream.offset(),
                }
            } else {
                SyncCursor {
                    last_sync_timestamp: first.max(start.last_sync_timestamp),
                    page_offset: 0,
                }
            };

            result.received += records.len();
            let summary = self.apply(records, cursor).await?;
            result.summary.merge(summary);
            result.pages += 1;
            tracing::debug!(
                page = result.pages,
                changes = page.changes.len(),
                has_more = page.has_more,
                offset = cursor.page_offset,
                "applied pull page"
            );
        }

        result.truncated = stream.truncated();
        if result.truncated {
            tracing::info!(
                pages = result.pages,
                "pull stopped at the page limit, resuming next cycle"
            );
        }
        Ok(result)
    }

    /// Applies one page on the blocking pool. The transaction either commits
    /// or rolls back even if the caller stops waiting.
    async fn apply(&self, records: Vec<SyncableRecord>, cursor: SyncCursor) -> SyncResult<ApplySummary> {
        let store = Arc::clone(self.store);
        let now = self.clock.now();
        let handle = tokio::task::spawn_blocking(move || {
            let mut audit = AuditLogger::new();
            let summary = store.transaction(|txn| {
                LocalApplier::apply_page(txn, records, cursor, now, &mut audit)
            })?;
            audit.committed();
            Ok::<_, SyncError>(summary)
        });
        handle
            .await
            .map_err(|e| SyncError::Protocol(format!("page apply task failed: {e}")))?
    }
}

/// Runs every pulled change through the schema boundary.
///
/// A change of an unknown type, with missing fields or with a malformed
/// tombstone fails the whole page.
pub fn validate_page(order: &TypeOrder, changes: &[WireChange]) -> SyncResult<Vec<SyncableRecord>> {
    changes
        .iter()
        .map(|change| {
            if !order.is_empty() {
                order.validate_change(change).map_err(|violation| {
                    SyncError::SchemaMismatch(format!("{}: {violation}", change.key()))
                })?;
            }
            change
                .to_record()
                .map_err(|e| SyncError::SchemaMismatch(e.to_string()))
        })
        .collect()
}
