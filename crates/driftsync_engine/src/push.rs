//! Push pipeline: sends due outbox rows and folds per-change outcomes back
//! into the outbox.

use crate::audit::AuditLogger;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::outbox::due_changes;
use crate::retry::{RetryController, TicketDisposition};
use crate::sorter::{Batch, DependencySorter};
use crate::transport::{with_deadline, SyncTransport};
use driftsync_protocol::{
    resolve, ChangeKey, ChangeOutcome, ChangeRecord, ChangeStatus, Clock, PushResponse,
    RecordType, RejectReason, Resolution, Timestamp,
};
use driftsync_store::{AuditKind, LocalStore, RetryKind, Transaction};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

/// Aggregated outcome of one push run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushResult {
    /// Changes the server stored (or already held).
    pub applied: Vec<ChangeKey>,
    /// Changes that lost to a newer server value, as settled in the outbox.
    pub conflicts: Vec<ChangeRecord>,
    /// Changes waiting on a parent the server does not have yet.
    pub dependency_conflicts: Vec<ChangeRecord>,
    /// Changes refused for good, locally or by the server.
    pub rejected: usize,
    /// Changes held back because a batch they depend on failed.
    pub deferred: usize,
    /// Changes whose retry budget ran out during this run.
    pub abandoned: usize,
    /// Changes of batches that hit a network failure.
    pub transient_failures: usize,
    /// Batches sent.
    pub batches_sent: usize,
    /// Sum of the server's `processed_count`.
    pub processed_count: u64,
    /// Latest server time seen.
    pub server_timestamp: Option<Timestamp>,
    /// Last network failure, if any batch hit one.
    pub last_error: Option<String>,
}

impl PushResult {
    /// Whether nothing was attempted.
    pub fn is_empty(&self) -> bool {
        self.batches_sent == 0 && self.rejected == 0 && self.deferred == 0
    }

    /// Number of changes the server accepted.
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Number of changes that lost to the server.
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }
}

/// Sends queued changes in dependency order.
pub struct PushPipeline<'a> {
    store: &'a LocalStore,
    transport: &'a dyn SyncTransport,
    config: &'a SyncConfig,
    retry: &'a RetryController,
    clock: &'a dyn Clock,
    cancelled: &'a AtomicBool,
}

impl<'a> PushPipeline<'a> {
    /// Creates a pipeline over borrowed engine parts.
    pub fn new(
        store: &'a LocalStore,
        transport: &'a dyn SyncTransport,
        config: &'a SyncConfig,
        retry: &'a RetryController,
        clock: &'a dyn Clock,
        cancelled: &'a AtomicBool,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            retry,
            clock,
            cancelled,
        }
    }

    /// Pushes every change that is due now.
    pub async fn run(&self) -> SyncResult<PushResult> {
        let now = self.clock.now();
        let due = self.store.read(|tables| due_changes(tables, now));
        if due.is_empty() {
            return Ok(PushResult::default());
        }

        let mut invalid = Vec::new();
        let mut valid = Vec::with_capacity(due.len());
        for change in due {
            match self.config.type_order.validate_change(&change.to_wire()) {
                Err(violation) if !violation.is_unknown_type() => {
                    invalid.push((change, violation.to_string()));
                }
                _ => valid.push(change),
            }
        }

        let sorted = DependencySorter::new(&self.config.type_order, self.config.max_payload_size)
            .with_max_changes(self.config.max_batch_changes)
            .sort(valid)?;
        for (change, size) in sorted.oversized {
            let message = format!(
                "change is {size} bytes, over the {} byte payload limit",
                self.config.max_payload_size
            );
            invalid.push((change, message));
        }

        let mut result = PushResult::default();
        if !invalid.is_empty() {
            result.rejected += self.reject_locally(invalid)?;
        }

        let pushed = self.push(sorted.batches).await?;
        merge(&mut result, pushed);
        Ok(result)
    }

    /// Sends `batches` in order.
    ///
    /// A batch that fails on the network is rescheduled with a transient
    /// ticket; later batches of the same type or of types depending on it are
    /// left queued for the next cycle. A batch the server refuses as too
    /// large is halved and resent; a single change it refuses is rejected.
    pub async fn push(&self, batches: Vec<Batch>) -> SyncResult<PushResult> {
        let mut result = PushResult::default();
        let mut failed_types: Vec<RecordType> = Vec::new();
        let mut queue: VecDeque<Batch> = batches.into();

        while let Some(batch) = queue.pop_front() {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }

            let blocked = failed_types.iter().any(|failed| {
                *failed == batch.record_type
                    || self.config.type_order.depends_on(&batch.record_type, failed)
            });
            if blocked {
                tracing::debug!(
                    record_type = %batch.record_type,
                    changes = batch.len(),
                    "deferring batch behind a failed parent batch"
                );
                result.deferred += batch.len();
                continue;
            }

            let keys: Vec<ChangeKey> = batch.changes.iter().map(ChangeRecord::key).collect();
            self.store.transaction(|txn| {
                for key in &keys {
                    set_status(txn, key, ChangeStatus::InFlight);
                    self.retry.mark_attempting(txn, key);
                }
                Ok::<_, SyncError>(())
            })?;

            let request = batch.to_request();
            tracing::debug!(
                record_type = %batch.record_type,
                changes = batch.len(),
                bytes = batch.serialized_size,
                "pushing batch"
            );
            result.batches_sent += 1;

            let response = with_deadline(
                self.config.request_timeout,
                self.transport.push(&request),
            )
            .await;

            match response {
                Ok(response) => {
                    self.settle(&batch, response, &mut result)?;
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        record_type = %batch.record_type,
                        changes = batch.len(),
                        error = %err,
                        "push batch failed"
                    );
                    result.abandoned += self.reschedule(&keys, &err)?;
                    result.transient_failures += keys.len();
                    result.last_error = Some(err.to_string());
                    failed_types.push(batch.record_type.clone());
                }
                Err(SyncError::TooLarge(message)) => {
                    self.release(&keys)?;
                    if batch.len() > 1 {
                        tracing::warn!(
                            record_type = %batch.record_type,
                            changes = batch.len(),
                            %message,
                            "server refused batch as too large, splitting"
                        );
                        let (front, back) = batch.split()?;
                        queue.push_front(back);
                        queue.push_front(front);
                    } else {
                        let refused = batch
                            .changes
                            .into_iter()
                            .map(|change| (change, format!("server refused change: {message}")))
                            .collect();
                        result.rejected += self.reject_locally(refused)?;
                    }
                }
                Err(err) => {
                    self.release(&keys)?;
                    return Err(err);
                }
            }
        }

        Ok(result)
    }

    /// Returns rows of a batch that never reached the server to the queue.
    fn release(&self, keys: &[ChangeKey]) -> SyncResult<()> {
        self.store.transaction(|txn| {
            for key in keys {
                revert_in_flight(txn, key);
                self.retry.revert_attempting(txn, key);
            }
            Ok::<_, SyncError>(())
        })
    }

    fn settle(
        &self,
        batch: &Batch,
        response: PushResponse,
        result: &mut PushResult,
    ) -> SyncResult<()> {
        let now = self.clock.now();
        let sent: HashMap<ChangeKey, Timestamp> = batch
            .changes
            .iter()
            .map(|c| (c.key(), c.updated_at))
            .collect();
        let wire: Vec<_> = batch.changes.iter().map(ChangeRecord::to_wire).collect();
        let outcomes = response.outcomes(&wire);

        let mut audit = AuditLogger::new();
        let mut mismatch: Option<String> = None;
        let mut settled = PushResult::default();

        self.store.transaction(|txn| {
            for (key, outcome) in outcomes {
                let Some(mut row) = txn.change(&key).cloned() else {
                    continue;
                };
                // Rows re-mutated while the batch was on the wire stay queued.
                if row.status != ChangeStatus::InFlight || sent.get(&key) != Some(&row.updated_at) {
                    continue;
                }

                match outcome {
                    ChangeOutcome::Applied => {
                        row.status = ChangeStatus::Applied;
                        row.acknowledged_at = Some(now);
                        txn.put_change(row);
                        self.retry.succeed(txn, &key);
                        settled.applied.push(key);
                    }
                    ChangeOutcome::Conflict { server_record } => {
                        row.status = ChangeStatus::Conflict;
                        row.acknowledged_at = Some(now);
                        settled.conflicts.push(row.clone());
                        txn.put_change(row);
                        self.retry.succeed(txn, &key);

                        let before = txn.record(&key).cloned();
                        let after = server_record.and_then(|w| w.to_record().ok());
                        if let Some(remote) = &after {
                            if resolve(before.as_ref(), remote) == Resolution::AcceptRemote {
                                txn.put_record(remote.clone());
                            }
                        }
                        audit.record(
                            txn,
                            now,
                            AuditKind::ConflictRemoteWins,
                            &key,
                            before,
                            after,
                            "server holds a value at least as new",
                        );
                    }
                    ChangeOutcome::DependencyConflict { missing } => {
                        row.status = ChangeStatus::DependencyConflict;
                        settled.dependency_conflicts.push(row.clone());
                        txn.put_change(row);
                        let detail = format!(
                            "missing parents: {}",
                            missing
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", ")
                        );
                        let disposition =
                            self.retry
                                .schedule_failure(txn, &key, RetryKind::Dependency, &detail);
                        let before = txn.record(&key).cloned();
                        audit.record(
                            txn,
                            now,
                            AuditKind::DependencyConflict,
                            &key,
                            before.clone(),
                            None,
                            detail.clone(),
                        );
                        if disposition == TicketDisposition::Abandoned {
                            audit.record(txn, now, AuditKind::Abandoned, &key, before, None, detail);
                            settled.abandoned += 1;
                        }
                    }
                    ChangeOutcome::Rejected(RejectReason::SchemaMismatch { message }) => {
                        row.status = ChangeStatus::Pending;
                        txn.put_change(row);
                        self.retry.revert_attempting(txn, &key);
                        mismatch.get_or_insert(message);
                    }
                    ChangeOutcome::Rejected(RejectReason::Validation { message }) => {
                        row.status = ChangeStatus::Failed;
                        txn.put_change(row);
                        self.retry.succeed(txn, &key);
                        let before = txn.record(&key).cloned();
                        audit.record(txn, now, AuditKind::Rejected, &key, before, None, message);
                        settled.rejected += 1;
                    }
                }
            }
            Ok::<_, SyncError>(())
        })?;
        audit.committed();

        merge(result, settled);
        result.processed_count += response.processed_count;
        result.server_timestamp = result.server_timestamp.max(Some(response.server_timestamp));

        match mismatch {
            Some(message) => Err(SyncError::SchemaMismatch(message)),
            None => Ok(()),
        }
    }

    /// Puts a failed batch back in the queue behind a transient ticket.
    /// Returns how many changes were abandoned.
    fn reschedule(&self, keys: &[ChangeKey], err: &SyncError) -> SyncResult<usize> {
        let now = self.clock.now();
        let message = err.to_string();
        let mut audit = AuditLogger::new();
        let abandoned = self.store.transaction(|txn| {
            let mut abandoned = 0;
            for key in keys {
                let in_flight = txn
                    .change(key)
                    .is_some_and(|row| row.status == ChangeStatus::InFlight);
                if !in_flight {
                    continue;
                }
                set_status(txn, key, ChangeStatus::Failed);
                let disposition =
                    self.retry
                        .schedule_failure(txn, key, RetryKind::Transient, &message);
                if disposition == TicketDisposition::Abandoned {
                    let before = txn.record(key).cloned();
                    audit.record(txn, now, AuditKind::Abandoned, key, before, None, message.clone());
                    abandoned += 1;
                }
            }
            Ok::<_, SyncError>(abandoned)
        })?;
        audit.committed();
        Ok(abandoned)
    }

    /// Marks changes that can never be sent as failed.
    fn reject_locally(&self, rejected: Vec<(ChangeRecord, String)>) -> SyncResult<usize> {
        let now = self.clock.now();
        let mut audit = AuditLogger::new();
        let count = rejected.len();
        self.store.transaction(|txn| {
            for (change, message) in rejected {
                let key = change.key();
                tracing::warn!(key = %key, reason = %message, "change rejected before sending");
                set_status(txn, &key, ChangeStatus::Failed);
                self.retry.succeed(txn, &key);
                let before = txn.record(&key).cloned();
                audit.record(txn, now, AuditKind::Rejected, &key, before, None, message);
            }
            Ok::<_, SyncError>(())
        })?;
        audit.committed();
        Ok(count)
    }
}

fn set_status(txn: &mut Transaction, key: &ChangeKey, status: ChangeStatus) {
    if let Some(mut row) = txn.change(key).cloned() {
        row.status = status;
        txn.put_change(row);
    }
}

fn revert_in_flight(txn: &mut Transaction, key: &ChangeKey) {
    let in_flight = txn
        .change(key)
        .is_some_and(|row| row.status == ChangeStatus::InFlight);
    if in_flight {
        let has_ticket = txn.ticket(key).is_some();
        set_status(
            txn,
            key,
            if has_ticket {
                ChangeStatus::Failed
            } else {
                ChangeStatus::Pending
            },
        );
    }
}

fn merge(into: &mut PushResult, other: PushResult) {
    into.applied.extend(other.applied);
    into.conflicts.extend(other.conflicts);
    into.dependency_conflicts.extend(other.dependency_conflicts);
    into.rejected += other.rejected;
    into.deferred += other.deferred;
    into.abandoned += other.abandoned;
    into.transient_failures += other.transient_failures;
    into.batches_sent += other.batches_sent;
    into.processed_count += other.processed_count;
    into.server_timestamp = into.server_timestamp.max(other.server_timestamp);
    if other.last_error.is_some() {
        into.last_error = other.last_error;
    }
}
