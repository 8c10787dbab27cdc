//! The sync engine: owns the pipelines and the background loop.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::outbox::{pending_count, ChangeTracker};
use crate::pull::PullPipeline;
use crate::push::PushPipeline;
use crate::retry::{abandoned, RetryController};
use crate::state::{SyncCycleResult, SyncState, SyncStats};
use crate::status::{StatusPublisher, SyncStatus};
use crate::transport::SyncTransport;
use driftsync_protocol::{ChangeKey, Clock, SystemClock, Timestamp};
use driftsync_store::{AuditEntry, LocalStore, RetryTicket};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Shortest sleep between loop iterations.
const MIN_WAKE: Duration = Duration::from_millis(100);

struct Inner {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    retry: RetryController,
    tracker: ChangeTracker,
    status: StatusPublisher,
    stats: RwLock<SyncStats>,
    cycle_lock: tokio::sync::Mutex<()>,
    trigger: Notify,
    cancelled: AtomicBool,
    halted: Mutex<Option<String>>,
    failures: AtomicU32,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Offline-first sync engine.
///
/// Created by the composition root and driven either manually through
/// [`SyncEngine::sync_once`] or by the background loop started with
/// [`SyncEngine::start`]. At most one cycle runs at a time.
pub struct SyncEngine {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl SyncEngine {
    /// Creates an engine using the system clock.
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        Self::with_clock(store, transport, config, Arc::new(SystemClock))
    }

    /// Creates an engine with an injected clock.
    ///
    /// Validates the configuration and resets changes left in flight by a
    /// previous process.
    pub fn with_clock(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let tracker = ChangeTracker::new(store.clone(), clock.clone());
        tracker.recover_in_flight()?;
        let retry = RetryController::new(config.retry.clone(), clock.clone());

        let inner = Arc::new(Inner {
            status: StatusPublisher::new(SyncStatus::default()),
            stats: RwLock::new(SyncStats::default()),
            cycle_lock: tokio::sync::Mutex::new(()),
            trigger: Notify::new(),
            cancelled: AtomicBool::new(false),
            halted: Mutex::new(None),
            failures: AtomicU32::new(0),
            store,
            transport,
            config,
            clock,
            retry,
            tracker,
        });
        inner.refresh();
        tracing::debug!(
            pending = inner.status.current().pending_count,
            "sync engine created"
        );

        Ok(Self {
            inner,
            worker: Mutex::new(None),
        })
    }

    /// The write path for local mutations.
    pub fn tracker(&self) -> &ChangeTracker {
        &self.inner.tracker
    }

    /// The local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    /// The configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Current time according to the engine's clock.
    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        let mut status = self.inner.status.current();
        status.pending_count = self.inner.tracker.pending_count();
        status
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        self.inner.status.current().state
    }

    /// Totals across cycles.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    /// Runs one push-then-pull cycle now.
    ///
    /// Waits for a cycle already in progress to finish first.
    pub async fn sync_once(&self) -> SyncResult<SyncCycleResult> {
        self.inner.cycle().await
    }

    /// Spawns the background loop on the current tokio runtime.
    pub fn start(&self) -> SyncResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(SyncError::AlreadyRunning);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::Config("start() needs a tokio runtime".into()))?;

        let (shutdown, receiver) = watch::channel(false);
        self.inner.cancelled.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = runtime.spawn(inner.run_loop(receiver));
        *worker = Some(Worker { shutdown, handle });
        Ok(())
    }

    /// Whether the background loop is running.
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stops the background loop and waits for it to exit.
    ///
    /// A cycle in progress stops at the next batch or page boundary; a page
    /// being applied is committed or rolled back first.
    pub async fn stop(&self) -> SyncResult<()> {
        let worker = self.worker.lock().take().ok_or(SyncError::NotRunning)?;
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _ = worker.shutdown.send(true);
        let joined = worker.handle.await;
        self.inner.cancelled.store(false, Ordering::SeqCst);
        self.inner.status.set_state(SyncState::Stopped);
        joined.map_err(|e| SyncError::Protocol(format!("sync loop panicked: {e}")))?;
        tracing::info!("sync loop stopped");
        Ok(())
    }

    /// Wakes the background loop for an immediate cycle.
    ///
    /// Several calls before the loop wakes up result in a single cycle.
    pub fn trigger_now(&self) {
        self.inner.trigger.notify_one();
    }

    /// Clears a schema-mismatch halt and triggers a cycle.
    pub fn resume(&self) {
        let previous = self.inner.halted.lock().take();
        if let Some(reason) = previous {
            tracing::info!(%reason, "sync resumed after halt");
            self.inner.status.update(|s| {
                s.halted = false;
                s.state = SyncState::Idle;
            });
            self.trigger_now();
        }
    }

    /// Changes whose retry budget is spent.
    pub fn abandoned(&self) -> Vec<RetryTicket> {
        self.inner.store.read(abandoned)
    }

    /// Resets a change's retry ticket so it goes out in the next cycle.
    pub fn force_retry(&self, key: &ChangeKey) -> SyncResult<()> {
        self.inner
            .store
            .transaction(|txn| self.inner.retry.force_retry(txn, key))?;
        self.inner.refresh();
        self.trigger_now();
        Ok(())
    }

    /// Gives up on a change: its ticket is destroyed and the row marked failed.
    pub fn discard(&self, key: &ChangeKey) -> SyncResult<()> {
        self.inner
            .store
            .transaction(|txn| self.inner.retry.discard(txn, key))?;
        self.inner.refresh();
        Ok(())
    }

    /// The persisted audit log.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.inner.store.read(|t| t.audit().to_vec())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            self.inner.cancelled.store(true, Ordering::SeqCst);
            let _ = worker.shutdown.send(true);
            worker.handle.abort();
        }
    }
}

impl Inner {
    async fn cycle(&self) -> SyncResult<SyncCycleResult> {
        let _guard = self.cycle_lock.lock().await;
        let halted = self.halted.lock().clone();
        if let Some(reason) = halted {
            return Err(SyncError::Halted(reason));
        }

        let started = Instant::now();
        let outcome = self.run_phases().await;
        self.refresh();

        match outcome {
            Ok(mut result) => {
                result.duration = started.elapsed();
                self.succeeded(&result);
                Ok(result)
            }
            Err(err) => {
                self.failed(&err);
                Err(err)
            }
        }
    }

    async fn run_phases(&self) -> SyncResult<SyncCycleResult> {
        self.status.set_state(SyncState::Pushing);
        let push = PushPipeline::new(
            &self.store,
            self.transport.as_ref(),
            &self.config,
            &self.retry,
            self.clock.as_ref(),
            &self.cancelled,
        )
        .run()
        .await;

        // A push that failed for reasons the server may not share still
        // lets remote changes through; the error is reported afterwards.
        let push = match push {
            Ok(push) => Ok(push),
            Err(err) if err.is_fatal() || matches!(err, SyncError::Cancelled) => return Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "push failed, pulling anyway");
                Err(err)
            }
        };

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }

        self.status.set_state(SyncState::Pulling);
        let pull = PullPipeline::new(
            &self.store,
            self.transport.as_ref(),
            &self.config,
            self.clock.as_ref(),
            &self.cancelled,
        )
        .run()
        .await?;

        let push = push?;

        let now = self.clock.now();
        let pruned = self
            .tracker
            .prune_applied(now, self.config.applied_retention)?;
        let audit_pruned = self.tracker.prune_audit(
            now,
            self.config.audit_retention,
            self.config.max_audit_entries,
        )?;

        Ok(SyncCycleResult {
            push,
            pull,
            pruned,
            audit_pruned,
            duration: Duration::ZERO,
        })
    }

    fn succeeded(&self, result: &SyncCycleResult) {
        let now = self.clock.now();
        self.stats.write().record_success(result, now);
        let degraded = result.had_transient_failure();
        if degraded {
            self.failures.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failures.store(0, Ordering::SeqCst);
        }

        self.status.update(|s| {
            s.state = if degraded {
                SyncState::RetryWait
            } else {
                SyncState::Synced
            };
            s.online = !degraded;
            s.last_sync_time = Some(now);
            s.last_error = result.push.last_error.clone();
        });
        tracing::info!(
            pushed = result.push.applied_count(),
            pulled = result.pull.received,
            conflicts = result.conflicts(),
            deferred = result.push.deferred,
            truncated = result.pull.truncated,
            duration_ms = result.duration.as_millis() as u64,
            "sync cycle complete"
        );
    }

    fn failed(&self, err: &SyncError) {
        if matches!(err, SyncError::Cancelled) {
            tracing::debug!("sync cycle cancelled");
            self.status.set_state(SyncState::Idle);
            return;
        }

        let message = err.to_string();
        self.stats.write().record_failure(message.clone());

        if err.is_fatal() {
            *self.halted.lock() = Some(message.clone());
            tracing::error!(error = %err, "sync halted until resumed");
            self.status.update(|s| {
                s.state = SyncState::Halted;
                s.halted = true;
                s.last_error = Some(message);
            });
        } else if err.is_transient() {
            let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(error = %err, failures, "sync cycle failed, will retry");
            self.status.update(|s| {
                s.state = SyncState::RetryWait;
                s.online = false;
                s.last_error = Some(message);
            });
        } else {
            tracing::error!(error = %err, "sync cycle failed");
            self.status.update(|s| {
                s.state = SyncState::Error;
                s.last_error = Some(message);
            });
        }
    }

    /// Re-reads counters from the store and rebuilds the retry schedule.
    fn refresh(&self) {
        let (pending, abandoned_count) = self.store.read(|tables| {
            self.retry.refresh(tables);
            (pending_count(tables), abandoned(tables).len())
        });
        self.tracker.publish();
        self.status.update(|s| {
            s.pending_count = pending;
            s.abandoned_count = abandoned_count;
        });
    }

    /// How long the loop sleeps before the next cycle.
    fn next_wait(&self) -> Duration {
        let mut wait = self.config.sync_interval;

        let failures = self.failures.load(Ordering::SeqCst);
        if failures > 0 {
            wait = wait.min(self.config.retry.delay_for_attempt(failures));
        }
        if let Some(next) = self.retry.next_wake() {
            wait = wait.min(next.duration_since(self.clock.now()));
        }
        wait.max(MIN_WAKE)
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.sync_interval.as_millis() as u64,
            "sync loop started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let halted = self.halted.lock().is_some();
            if !halted {
                if let Err(SyncError::Cancelled) = self.cycle().await {
                    break;
                }
            }

            let wait = self.next_wait();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.trigger.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use driftsync_protocol::{
        ManualClock, Payload, PullResponse, PushResponse, RecordSchema, TypeOrder,
    };

    fn engine(transport: Arc<MockTransport>) -> (SyncEngine, Arc<ManualClock>) {
        let order = TypeOrder::new(vec![RecordSchema::new("voter")]).unwrap();
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let engine = SyncEngine::with_clock(
            Arc::new(LocalStore::open_in_memory()),
            transport,
            SyncConfig::new(order),
            clock.clone(),
        )
        .unwrap();
        (engine, clock)
    }

    fn empty_page() -> PullResponse {
        PullResponse {
            server_timestamp: Timestamp::from_millis(2_000),
            ..PullResponse::default()
        }
    }

    #[tokio::test]
    async fn sync_once_pushes_then_pulls() {
        let transport = Arc::new(MockTransport::new());
        let (engine, _) = engine(transport.clone());
        engine.tracker().put("voter", "v1", Payload::new()).unwrap();
        assert_eq!(engine.status().pending_count, 1);

        transport.queue_push_response(PushResponse {
            processed_count: 1,
            server_timestamp: Timestamp::from_millis(1_500),
            ..PushResponse::default()
        });
        transport.queue_pull_response(empty_page());

        let result = engine.sync_once().await.unwrap();
        assert_eq!(result.push.applied, vec![ChangeKey::new("voter", "v1")]);
        assert_eq!(result.pull.pages, 1);

        let status = engine.status();
        assert_eq!(status.state, SyncState::Synced);
        assert!(status.online);
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.last_sync_time, Some(Timestamp::from_millis(1_000)));
        assert_eq!(engine.stats().cycles_completed, 1);
    }

    #[tokio::test]
    async fn transient_failure_reports_offline() {
        let transport = Arc::new(MockTransport::new());
        let (engine, _) = engine(transport.clone());
        transport.queue_pull_error(SyncError::transport_retryable("no route to host"));

        let err = engine.sync_once().await.unwrap_err();
        assert!(err.is_transient());
        let status = engine.status();
        assert_eq!(status.state, SyncState::RetryWait);
        assert!(!status.online);
        assert!(status.last_error.unwrap().contains("no route to host"));
    }

    #[tokio::test]
    async fn schema_mismatch_halts_until_resume() {
        let transport = Arc::new(MockTransport::new());
        let (engine, _) = engine(transport.clone());
        transport.queue_pull_error(SyncError::SchemaMismatch("unknown type 'ballot'".into()));

        assert!(engine.sync_once().await.unwrap_err().is_fatal());
        assert!(engine.status().halted);
        assert!(matches!(engine.sync_once().await, Err(SyncError::Halted(_))));

        engine.resume();
        assert!(!engine.status().halted);
        transport.queue_pull_response(empty_page());
        engine.sync_once().await.unwrap();
        assert_eq!(engine.state(), SyncState::Synced);
    }

    #[tokio::test]
    async fn start_and_stop_background_loop() {
        let transport = Arc::new(MockTransport::new());
        let (engine, _) = engine(transport.clone());
        transport.queue_pull_response(empty_page());

        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(SyncError::AlreadyRunning)));
        assert!(engine.is_running());

        let mut status = engine.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while status.borrow_and_update().state != SyncState::Synced {
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.state(), SyncState::Stopped);
        assert!(matches!(engine.stop().await, Err(SyncError::NotRunning)));
    }

    #[tokio::test]
    async fn failed_push_still_pulls() {
        let transport = Arc::new(MockTransport::new());
        let (engine, _) = engine(transport.clone());
        engine.tracker().put("voter", "v1", Payload::new()).unwrap();

        transport.queue_push_error(SyncError::Protocol("HTTP 400: bad request".into()));
        transport.queue_pull_response(empty_page());

        let err = engine.sync_once().await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert_eq!(transport.pulled().len(), 1);
        assert_eq!(engine.status().pending_count, 1);
        assert_eq!(engine.stats().cycles_failed, 1);
    }

    #[tokio::test]
    async fn cycles_prune_the_audit_log() {
        let transport = Arc::new(MockTransport::new());
        let order = TypeOrder::new(vec![RecordSchema::new("voter")]).unwrap();
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let engine = SyncEngine::with_clock(
            Arc::new(LocalStore::open_in_memory()),
            transport.clone(),
            SyncConfig::new(order).with_audit_retention(Duration::from_secs(3_600), 2),
            clock.clone(),
        )
        .unwrap();
        engine
            .store()
            .transaction(|txn| {
                for at in [100, 200, 300] {
                    txn.append_audit(AuditEntry {
                        sequence: 0,
                        at: Timestamp::from_millis(at),
                        kind: driftsync_store::AuditKind::Rejected,
                        key: ChangeKey::new("voter", "v1"),
                        before: None,
                        after: None,
                        detail: String::new(),
                    });
                }
                Ok::<_, SyncError>(())
            })
            .unwrap();

        transport.queue_pull_response(empty_page());
        let result = engine.sync_once().await.unwrap();
        assert_eq!(result.audit_pruned, 1);
        let kept: Vec<i64> = engine
            .store()
            .read(|t| t.audit().iter().map(|e| e.at.as_millis()).collect());
        assert_eq!(kept, vec![200, 300]);
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let result = SyncEngine::new(
            Arc::new(LocalStore::open_in_memory()),
            Arc::new(MockTransport::new()),
            SyncConfig::default().with_pull_page_size(0),
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
