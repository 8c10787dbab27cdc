//! Retry tickets and the wake-up scheduler.
//!
//! Tickets live in the store; the controller keeps an in-memory min-heap of
//! their due times so the background loop knows when to wake up next. The
//! heap is rebuilt from the store after every cycle.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use driftsync_protocol::{ChangeKey, ChangeStatus, Clock, Timestamp};
use driftsync_store::{RetryKind, RetryTicket, Tables, TicketState, Transaction};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// What happened to a ticket after a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketDisposition {
    /// Another attempt is scheduled.
    Scheduled(Timestamp),
    /// The attempt budget is spent.
    Abandoned,
}

/// Min-heap of scheduled tickets keyed by due time.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    heap: BinaryHeap<Reverse<(Timestamp, ChangeKey)>>,
}

impl RetryScheduler {
    /// Rebuilds the heap from the store's tickets.
    pub fn refresh(&mut self, tables: &Tables) {
        self.heap = tables
            .tickets()
            .filter(|t| t.state == TicketState::Scheduled)
            .map(|t| Reverse((t.next_retry_at, t.change_id.clone())))
            .collect();
    }

    /// Earliest scheduled retry.
    pub fn next_wake(&self) -> Option<Timestamp> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Number of scheduled tickets.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Owns retry tickets: creates them on failure, advances them through
/// `scheduled → attempting → scheduled | abandoned`, and destroys them on
/// success or discard.
pub struct RetryController {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
    scheduler: Mutex<RetryScheduler>,
}

impl RetryController {
    /// Creates a controller.
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            scheduler: Mutex::new(RetryScheduler::default()),
        }
    }

    /// Retry configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Records a failed attempt for `key` and schedules the next one.
    pub fn schedule_failure(
        &self,
        txn: &mut Transaction,
        key: &ChangeKey,
        kind: RetryKind,
        error: &str,
    ) -> TicketDisposition {
        let now = self.clock.now();
        let attempt_count = txn.ticket(key).map_or(0, |t| t.attempt_count) + 1;

        let (state, disposition, next_retry_at) = if attempt_count >= self.config.max_retries {
            (TicketState::Abandoned, TicketDisposition::Abandoned, now)
        } else {
            let delay = match kind {
                RetryKind::Transient => self.config.delay_for_attempt(attempt_count),
                RetryKind::Dependency => self.config.dependency_delay(),
            };
            let at = now.saturating_add(delay);
            (TicketState::Scheduled, TicketDisposition::Scheduled(at), at)
        };

        txn.put_ticket(RetryTicket {
            change_id: key.clone(),
            next_retry_at,
            attempt_count,
            last_error: error.to_string(),
            kind,
            state,
        });

        match disposition {
            TicketDisposition::Scheduled(at) => {
                tracing::debug!(key = %key, %kind, attempt_count, next_retry_at = %at, "retry scheduled");
            }
            TicketDisposition::Abandoned => {
                tracing::warn!(key = %key, %kind, attempt_count, error, "retry budget exhausted");
            }
        }
        disposition
    }

    /// Marks the ticket of a change being sent as `attempting`.
    pub fn mark_attempting(&self, txn: &mut Transaction, key: &ChangeKey) {
        if let Some(mut ticket) = txn.ticket(key).cloned() {
            if ticket.state == TicketState::Scheduled {
                ticket.state = TicketState::Attempting;
                txn.put_ticket(ticket);
            }
        }
    }

    /// Returns an `attempting` ticket to `scheduled` without counting an attempt.
    pub fn revert_attempting(&self, txn: &mut Transaction, key: &ChangeKey) {
        if let Some(mut ticket) = txn.ticket(key).cloned() {
            if ticket.state == TicketState::Attempting {
                ticket.state = TicketState::Scheduled;
                txn.put_ticket(ticket);
            }
        }
    }

    /// Destroys the ticket after a final verdict.
    pub fn succeed(&self, txn: &mut Transaction, key: &ChangeKey) {
        txn.remove_ticket(key);
    }

    /// Resets an existing ticket so the change is retried right away.
    pub fn force_retry(&self, txn: &mut Transaction, key: &ChangeKey) -> SyncResult<()> {
        let mut ticket = txn
            .ticket(key)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;
        ticket.attempt_count = 0;
        ticket.next_retry_at = self.clock.now();
        ticket.state = TicketState::Scheduled;
        txn.put_ticket(ticket);
        tracing::info!(key = %key, "retry forced by operator");
        Ok(())
    }

    /// Destroys the ticket and marks the change failed for good.
    pub fn discard(&self, txn: &mut Transaction, key: &ChangeKey) -> SyncResult<()> {
        let mut row = txn
            .change(key)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;
        txn.remove_ticket(key);
        row.status = ChangeStatus::Failed;
        txn.put_change(row);
        tracing::info!(key = %key, "change discarded by operator");
        Ok(())
    }

    /// Rebuilds the in-memory schedule from the store.
    pub fn refresh(&self, tables: &Tables) {
        self.scheduler.lock().refresh(tables);
    }

    /// Earliest scheduled retry, if any.
    pub fn next_wake(&self) -> Option<Timestamp> {
        self.scheduler.lock().next_wake()
    }
}

/// Abandoned tickets, oldest first.
pub fn abandoned(tables: &Tables) -> Vec<RetryTicket> {
    let mut tickets: Vec<RetryTicket> = tables
        .tickets()
        .filter(|t| t.state == TicketState::Abandoned)
        .cloned()
        .collect();
    tickets.sort_by_key(|t| t.next_retry_at);
    tickets
}
