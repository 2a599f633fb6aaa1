//! Scheduling service - the delivery loop
//!
//! Payloads move through `QUEUED → IN_FLIGHT → {DELIVERED, RETRY_QUEUED, DROPPED}`.
//!
//! ## Flow
//!
//! ```text
//! intake ──→ on_payload_intake ──→ wake ──┐
//! connectivity regained ──────────→ wake ──┤
//! earliest retry / unblock due ─→ timer ───┤
//!                                          ▼
//!                         drain pass (priority order)
//!                                          │
//!                            BackgroundWorker (N slots)
//!                                          │
//!                      IRequestExecutionService::execute
//!                     ┌────────────┼─────────────────┐
//!                  Success    TransientFailure   PermanentFailure
//!                  delete     backoff / 429      mark_undeliverable
//!                             (drop when exhausted)
//! ```
//!
//! A drain pass rebuilds its queue from the payload store whenever intake
//! reports new payloads or the queue runs dry. Each payload is attempted at
//! most once per pass, so a pass always ends; the loop then sleeps until the
//! next retry or endpoint unblock is due, or until it is woken.

use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parcel_core::connectivity::NetworkConnectivityListener;
use parcel_core::domain::trace::trace;
use parcel_core::domain::{DeliveryTraceState, DeliveryTracer, Endpoint, StoredTelemetryMetadata};
use parcel_core::ports::{
    ExecutionResult, IPayloadStore, IRequestExecutionService, ISchedulingService, InternalErrorHandler,
    InternalErrorType,
};
use parcel_storage::MetricsRegistry;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::retry::RetryPolicy;
use crate::worker::BackgroundWorker;

/// Failure bookkeeping for one payload
#[derive(Debug, Clone, Copy)]
struct RetryState {
    failed_attempts: u32,
    next_retry_at: Instant,
}

enum LoadOutcome {
    Loaded(Vec<u8>),
    Missing,
    Unreadable(String),
}

/// Counts returned by [`SchedulingService::flush`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Payloads handed to the request execution service
    pub attempted: usize,
    pub delivered: usize,
    pub dropped: usize,
    /// Payloads still awaiting delivery afterwards
    pub remaining: usize,
}

struct RunningLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the delivery loop
///
/// Always used behind an `Arc`: the loop task, the delivery jobs and the
/// connectivity service all hold a reference.
pub struct SchedulingService {
    store: Arc<dyn IPayloadStore>,
    executor: Arc<dyn IRequestExecutionService>,
    lane: BackgroundWorker,
    policy: RetryPolicy,
    error_handler: Arc<dyn InternalErrorHandler>,
    metrics: Option<Arc<MetricsRegistry>>,
    tracer: Option<Arc<DeliveryTracer>>,
    /// Payloads currently being delivered
    active: DashSet<StoredTelemetryMetadata>,
    retries: DashMap<StoredTelemetryMetadata, RetryState>,
    /// Endpoints paused by a `429 Retry-After`, until the given instant
    blocked: DashMap<Endpoint, Instant>,
    query_for_payloads: AtomicBool,
    connected: AtomicBool,
    wake: Notify,
    attempts: AtomicUsize,
    delivered: AtomicUsize,
    dropped: AtomicUsize,
    running: Mutex<Option<RunningLoop>>,
}

impl SchedulingService {
    pub fn new(
        store: Arc<dyn IPayloadStore>,
        executor: Arc<dyn IRequestExecutionService>,
        policy: RetryPolicy,
        max_concurrent_deliveries: usize,
        error_handler: Arc<dyn InternalErrorHandler>,
    ) -> Self {
        Self {
            store,
            executor,
            lane: BackgroundWorker::new("delivery", max_concurrent_deliveries),
            policy,
            error_handler,
            metrics: None,
            tracer: None,
            active: DashSet::new(),
            retries: DashMap::new(),
            blocked: DashMap::new(),
            query_for_payloads: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            wake: Notify::new(),
            attempts: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<DeliveryTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Sets the connectivity assumed until the first transition is observed
    #[must_use]
    pub fn with_initial_connectivity(self, connected: bool) -> Self {
        self.connected.store(connected, Ordering::SeqCst);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts the delivery loop; a no-op if it is already running
    ///
    /// The first pass is seeded from the payloads already on disk.
    pub fn start(self: &Arc<Self>) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).run(cancel.clone()));
        *running = Some(RunningLoop { cancel, task });
    }

    /// Stops the loop and waits for in-flight deliveries to finish
    ///
    /// Deliveries are never cancelled mid-flight. The service can be started
    /// again afterwards.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!(error = %e, "Delivery loop task failed");
        }
        if let Err(e) = self.lane.wait_idle().await {
            warn!(error = %e, "Delivery lane closed while stopping");
        }
        info!("Scheduling service stopped");
    }

    /// Runs one drain pass outside the loop and waits for its deliveries
    ///
    /// Payloads waiting on a retry or a blocked endpoint are left alone.
    pub async fn flush(self: &Arc<Self>) -> FlushReport {
        let attempts_before = self.attempts.load(Ordering::SeqCst);
        let delivered_before = self.delivered.load(Ordering::SeqCst);
        let dropped_before = self.dropped.load(Ordering::SeqCst);

        self.drain(&CancellationToken::new()).await;
        if let Err(e) = self.lane.wait_idle().await {
            warn!(error = %e, "Delivery lane closed while flushing");
        }

        FlushReport {
            attempted: self.attempts.load(Ordering::SeqCst) - attempts_before,
            delivered: self.delivered.load(Ordering::SeqCst) - delivered_before,
            dropped: self.dropped.load(Ordering::SeqCst) - dropped_before,
            remaining: self.list_payloads().await.len(),
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            concurrency = self.lane.concurrency(),
            max_attempts = self.policy.max_attempts,
            "Delivery loop started"
        );
        loop {
            let queued = self.drain(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            let next = self.next_wakeup();
            debug!(
                queued,
                sleep_ms = next.map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64),
                "Drain pass finished"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep_until(next) => {}
            }
        }
        info!("Delivery loop stopped");
    }

    // ========================================================================
    // Drain pass
    // ========================================================================

    /// Queues every eligible payload once, in priority order, and returns
    /// how many were queued
    async fn drain(self: &Arc<Self>, cancel: &CancellationToken) -> usize {
        self.query_for_payloads.store(false, Ordering::SeqCst);
        let mut attempted = HashSet::new();
        let mut queue = self.create_queue(&attempted).await;

        while let Some(metadata) = queue.pop_front() {
            if cancel.is_cancelled() {
                break;
            }
            if !self.is_connected() {
                debug!("No connectivity, pausing deliveries");
                break;
            }
            if self.should_send(&metadata) {
                self.update_blocked_endpoint(metadata.envelope_type().endpoint());
                attempted.insert(metadata.clone());
                if let Err(e) = self.queue_delivery(metadata, cancel).await {
                    self.error_handler
                        .track_internal_error(InternalErrorType::DeliveryFail, &anyhow::Error::new(e));
                    break;
                }
            }
            if self.query_for_payloads.swap(false, Ordering::SeqCst) || queue.is_empty() {
                queue = self.create_queue(&attempted).await;
            }
        }
        attempted.len()
    }

    async fn create_queue(&self, attempted: &HashSet<StoredTelemetryMetadata>) -> VecDeque<StoredTelemetryMetadata> {
        let listed = self.list_payloads().await;

        // Retry state for payloads that are gone would keep waking the loop.
        let present: HashSet<&StoredTelemetryMetadata> = listed.iter().collect();
        self.retries
            .retain(|m, _| present.contains(m) || self.active.contains(m));

        listed
            .into_iter()
            .filter(|m| !attempted.contains(m) && self.should_send(m))
            .collect()
    }

    async fn list_payloads(&self) -> Vec<StoredTelemetryMetadata> {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.get_payloads_by_priority()).await {
            Ok(listed) => listed,
            Err(e) => {
                self.error_handler
                    .track_internal_error(InternalErrorType::DeliveryFail, &anyhow::Error::new(e));
                Vec::new()
            }
        }
    }

    /// Not in flight, endpoint not blocked, and retry time (if any) reached
    fn should_send(&self, metadata: &StoredTelemetryMetadata) -> bool {
        if self.active.contains(metadata) || self.is_endpoint_blocked(metadata.envelope_type().endpoint()) {
            return false;
        }
        self.retries
            .get(metadata)
            .map_or(true, |retry| Instant::now() >= retry.next_retry_at)
    }

    fn is_endpoint_blocked(&self, endpoint: Endpoint) -> bool {
        self.blocked
            .get(&endpoint)
            .map_or(false, |until| *until > Instant::now())
    }

    fn update_blocked_endpoint(&self, endpoint: Endpoint) {
        self.blocked.remove_if(&endpoint, |_, until| *until <= Instant::now());
    }

    /// Earliest instant at which a payload may become eligible again
    fn next_wakeup(&self) -> Option<Instant> {
        if !self.is_connected() {
            return None;
        }
        let now = Instant::now();
        self.blocked.retain(|_, until| *until > now);

        let retry_due = self
            .retries
            .iter()
            .filter(|entry| !self.active.contains(entry.key()))
            .map(|entry| {
                let endpoint = entry.key().envelope_type().endpoint();
                let at = entry.value().next_retry_at;
                match self.blocked.get(&endpoint) {
                    Some(until) => at.max(*until),
                    None => at,
                }
            })
            .min();
        let unblock_due = self.blocked.iter().map(|entry| *entry.value()).min();

        match (retry_due, unblock_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn queue_delivery(
        self: &Arc<Self>,
        metadata: StoredTelemetryMetadata,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        self.active.insert(metadata.clone());
        let key = metadata.clone();
        let this = Arc::clone(self);
        let job = async move {
            // A 429 for an earlier payload may have landed while this one waited for a slot.
            if this.is_endpoint_blocked(metadata.envelope_type().endpoint()) {
                debug!(filename = %metadata.filename(), "Endpoint blocked, delivery deferred");
            } else {
                this.deliver(&metadata).await;
            }
            this.active.remove(&metadata);
            this.wake.notify_one();
        };

        let spawned = tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            spawned = self.lane.spawn(job) => spawned.map(Some),
        };
        match spawned {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                self.active.remove(&key);
                Ok(())
            }
            Err(e) => {
                self.active.remove(&key);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Single delivery
    // ========================================================================

    async fn deliver(&self, metadata: &StoredTelemetryMetadata) {
        let filename = metadata.filename();
        self.record(DeliveryTraceState::DeliveryStarted {
            filename: filename.clone(),
        });

        let payload = match self.load(metadata).await {
            LoadOutcome::Loaded(payload) => payload,
            LoadOutcome::Missing => {
                self.retries.remove(metadata);
                debug!(filename = %filename, "Payload vanished before delivery");
                self.record(DeliveryTraceState::PayloadMissing { filename });
                return;
            }
            LoadOutcome::Unreadable(reason) => {
                self.drop_payload(metadata, reason).await;
                return;
            }
        };

        self.attempts.fetch_add(1, Ordering::SeqCst);
        let result = self.executor.execute(payload, metadata).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_delivery_attempt(metadata.envelope_type().description(), result.label());
        }

        match result {
            ExecutionResult::Success => {
                self.retries.remove(metadata);
                info!(filename = %filename, "Payload delivered");
                self.record(DeliveryTraceState::DeliverySucceeded { filename });
                self.delete(metadata).await;
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
            ExecutionResult::PermanentFailure { reason } => {
                self.drop_payload(metadata, reason).await;
            }
            ExecutionResult::TransientFailure { reason, retry_after } => {
                self.schedule_retry(metadata, reason, retry_after).await;
            }
        }
    }

    async fn load(&self, metadata: &StoredTelemetryMetadata) -> LoadOutcome {
        let store = Arc::clone(&self.store);
        let metadata = metadata.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let Some(mut reader) = store.load_payload_as_stream(&metadata) else {
                return LoadOutcome::Missing;
            };
            let mut payload = Vec::new();
            match reader.read_to_end(&mut payload) {
                Ok(_) => LoadOutcome::Loaded(payload),
                Err(e) => LoadOutcome::Unreadable(format!("payload unreadable: {e}")),
            }
        })
        .await;
        loaded.unwrap_or_else(|e| LoadOutcome::Unreadable(format!("payload load panicked: {e}")))
    }

    async fn schedule_retry(
        &self,
        metadata: &StoredTelemetryMetadata,
        reason: String,
        retry_after: Option<Duration>,
    ) {
        let failed_attempts = self
            .retries
            .get(metadata)
            .map_or(0, |retry| retry.failed_attempts)
            + 1;
        if self.policy.is_exhausted(failed_attempts) {
            let reason = format!("{reason} (gave up after {failed_attempts} attempts)");
            self.drop_payload(metadata, reason).await;
            return;
        }

        let delay = match retry_after {
            Some(after) => {
                let after = self.policy.clamp(after);
                self.block_endpoint(metadata.envelope_type().endpoint(), after);
                after
            }
            None => self.policy.delay_for(failed_attempts),
        };
        self.retries.insert(
            metadata.clone(),
            RetryState {
                failed_attempts,
                next_retry_at: Instant::now() + delay,
            },
        );

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        warn!(
            filename = %metadata.filename(),
            attempt = failed_attempts,
            delay_ms,
            reason = %reason,
            "Delivery failed, retry scheduled"
        );
        self.record(DeliveryTraceState::RetryScheduled {
            filename: metadata.filename(),
            attempt: failed_attempts,
            delay_ms,
        });
    }

    fn block_endpoint(&self, endpoint: Endpoint, after: Duration) {
        self.blocked.insert(endpoint, Instant::now() + after);
        let after_ms = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
        let until_ms = chrono::Utc::now().timestamp_millis().saturating_add(after_ms);
        info!(endpoint = endpoint.path(), after_ms, "Endpoint rate limited");
        self.record(DeliveryTraceState::EndpointBlocked {
            endpoint: endpoint.path(),
            until_ms,
        });
    }

    async fn drop_payload(&self, metadata: &StoredTelemetryMetadata, reason: String) {
        self.retries.remove(metadata);
        let store = Arc::clone(&self.store);
        let target = metadata.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || store.mark_undeliverable(&target)).await {
            self.error_handler
                .track_internal_error(InternalErrorType::PayloadDropFail, &anyhow::Error::new(e));
        }
        self.dropped.fetch_add(1, Ordering::SeqCst);
        warn!(filename = %metadata.filename(), reason = %reason, "Payload dropped");
        self.record(DeliveryTraceState::PayloadDropped {
            filename: metadata.filename(),
            reason,
        });
    }

    async fn delete(&self, metadata: &StoredTelemetryMetadata) {
        let store = Arc::clone(&self.store);
        let target = metadata.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || store.delete(&target, None)).await {
            self.error_handler
                .track_internal_error(InternalErrorType::PayloadDeleteFail, &anyhow::Error::new(e));
        }
    }

    fn record(&self, state: DeliveryTraceState) {
        trace(self.tracer.as_deref(), state);
    }
}

impl ISchedulingService for SchedulingService {
    fn on_payload_intake(&self) {
        self.query_for_payloads.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

impl NetworkConnectivityListener for SchedulingService {
    fn on_network_connectivity_status_changed(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        info!(connected, "Delivery connectivity changed");
        self.record(DeliveryTraceState::ConnectivityChanged { connected });
        if connected {
            self.query_for_payloads.store(true, Ordering::SeqCst);
            self.wake.notify_one();
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use parcel_core::domain::EnvelopeType;
    use parcel_core::ports::RecordingErrorHandler;
    use parcel_storage::{FilePayloadStorageService, StorageLocation, StorageService};

    use super::*;

    type Responder = Box<dyn Fn(&StoredTelemetryMetadata, usize) -> ExecutionResult + Send + Sync>;

    /// Answers each call with `respond(metadata, previous calls for it)`
    struct FakeExecutor {
        calls: StdMutex<Vec<(StoredTelemetryMetadata, Vec<u8>)>>,
        respond: Responder,
    }

    impl FakeExecutor {
        fn new(respond: impl Fn(&StoredTelemetryMetadata, usize) -> ExecutionResult + Send + Sync + 'static) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        fn succeeding() -> Self {
            Self::new(|_, _| ExecutionResult::Success)
        }

        fn called(&self) -> Vec<StoredTelemetryMetadata> {
            self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }
    }

    #[async_trait]
    impl IRequestExecutionService for FakeExecutor {
        async fn execute(&self, payload: Vec<u8>, metadata: &StoredTelemetryMetadata) -> ExecutionResult {
            let previous = {
                let mut calls = self.calls.lock().unwrap();
                let previous = calls.iter().filter(|(m, _)| m == metadata).count();
                calls.push((metadata.clone(), payload));
                previous
            };
            (self.respond)(metadata, previous)
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        store: Arc<FilePayloadStorageService>,
        executor: Arc<FakeExecutor>,
        tracer: Arc<DeliveryTracer>,
        metrics: Arc<MetricsRegistry>,
        service: Arc<SchedulingService>,
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(20),
            multiplier: 2.0,
            max_delay: Duration::from_millis(200),
            max_attempts,
        }
    }

    fn fixture_with(executor: FakeExecutor, policy: RetryPolicy) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageService::new(root.path().join("files"), root.path().join("cache")));
        let errors = Arc::new(RecordingErrorHandler::new());
        let store = Arc::new(FilePayloadStorageService::new(storage, StorageLocation::Payloads, errors.clone()));
        let executor = Arc::new(executor);
        let tracer = Arc::new(DeliveryTracer::default());
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let service = Arc::new(
            SchedulingService::new(store.clone(), executor.clone(), policy, 1, errors)
                .with_tracer(tracer.clone())
                .with_metrics(metrics.clone()),
        );
        Fixture {
            _root: root,
            store,
            executor,
            tracer,
            metrics,
            service,
        }
    }

    fn meta(envelope_type: EnvelopeType, timestamp: i64) -> StoredTelemetryMetadata {
        StoredTelemetryMetadata::new(timestamp, format!("id-{timestamp}"), "pid", envelope_type, true).unwrap()
    }

    fn put(store: &FilePayloadStorageService, m: &StoredTelemetryMetadata) {
        let body = format!("{{\"payload\":\"{}\"}}", m.filename());
        store
            .store(m, Box::new(move |w: &mut dyn Write| w.write_all(body.as_bytes())))
            .unwrap();
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_delivers_in_priority_order_and_deletes() {
        let f = fixture_with(FakeExecutor::succeeding(), fast_policy(3));
        let network = meta(EnvelopeType::Network, 1);
        let log = meta(EnvelopeType::Log, 2);
        let crash = meta(EnvelopeType::Crash, 3);
        let session = meta(EnvelopeType::Session, 4);
        for m in [&network, &log, &crash, &session] {
            put(&f.store, m);
        }

        let report = f.service.flush().await;

        assert_eq!(f.executor.called(), vec![crash, session, log, network.clone()]);
        assert_eq!(
            report,
            FlushReport {
                attempted: 4,
                delivered: 4,
                dropped: 0,
                remaining: 0,
            }
        );
        let payload = f.executor.calls.lock().unwrap()[3].1.clone();
        assert_eq!(payload, format!("{{\"payload\":\"{}\"}}", network.filename()).into_bytes());
        assert!(f
            .metrics
            .encode()
            .unwrap()
            .contains("parcel_delivery_attempts_total{envelope_type=\"network\",result=\"success\"} 1"));
    }

    #[tokio::test]
    async fn test_permanent_failure_drops_without_retry() {
        let f = fixture_with(FakeExecutor::new(|_, _| ExecutionResult::permanent("HTTP 400")), fast_policy(3));
        let m = meta(EnvelopeType::Log, 1);
        put(&f.store, &m);

        let report = f.service.flush().await;

        assert_eq!(report.dropped, 1);
        assert!(f.store.get_payloads_by_priority().is_empty());
        assert_eq!(f.store.get_dropped_payloads(), vec![m.clone()]);
        assert!(f.tracer.states().contains(&DeliveryTraceState::PayloadDropped {
            filename: m.filename(),
            reason: "HTTP 400".to_string(),
        }));

        // A second pass does not see the dropped payload.
        assert_eq!(f.service.flush().await.attempted, 0);
        assert_eq!(f.executor.called().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_by_loop() {
        let f = fixture_with(
            FakeExecutor::new(|_, previous| {
                if previous == 0 {
                    ExecutionResult::transient("HTTP 503")
                } else {
                    ExecutionResult::Success
                }
            }),
            fast_policy(3),
        );
        let m = meta(EnvelopeType::Session, 1);
        put(&f.store, &m);

        f.service.start();
        wait_until("retried delivery", || f.store.get_payloads_by_priority().is_empty()).await;
        f.service.stop().await;

        assert_eq!(f.executor.called(), vec![m.clone(), m.clone()]);
        assert!(f.tracer.states().iter().any(|s| matches!(
            s,
            DeliveryTraceState::RetryScheduled { attempt: 1, .. }
        )));
    }

    #[tokio::test]
    async fn test_retry_not_attempted_before_backoff() {
        let f = fixture_with(
            FakeExecutor::new(|_, _| ExecutionResult::transient("HTTP 500")),
            RetryPolicy {
                initial_delay: Duration::from_secs(60),
                ..fast_policy(3)
            },
        );
        let m = meta(EnvelopeType::Log, 1);
        put(&f.store, &m);

        assert_eq!(f.service.flush().await.attempted, 1);
        assert_eq!(f.service.flush().await.attempted, 0);
        assert_eq!(f.store.get_payloads_by_priority(), vec![m]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_payload() {
        let f = fixture_with(FakeExecutor::new(|_, _| ExecutionResult::transient("timeout")), fast_policy(3));
        let m = meta(EnvelopeType::Log, 1);
        put(&f.store, &m);

        f.service.start();
        wait_until("payload dropped", || !f.store.get_dropped_payloads().is_empty()).await;
        f.service.stop().await;

        assert_eq!(f.executor.called().len(), 3);
        assert!(f.store.get_payloads_by_priority().is_empty());
    }

    #[tokio::test]
    async fn test_too_many_requests_blocks_endpoint() {
        let f = fixture_with(
            FakeExecutor::new(|m, previous| {
                if m.envelope_type() == EnvelopeType::Log && m.timestamp() == 1 && previous == 0 {
                    ExecutionResult::TransientFailure {
                        reason: "HTTP 429".to_string(),
                        retry_after: Some(Duration::from_millis(150)),
                    }
                } else {
                    ExecutionResult::Success
                }
            }),
            fast_policy(5),
        );
        let first_log = meta(EnvelopeType::Log, 1);
        let second_log = meta(EnvelopeType::Log, 2);
        let session = meta(EnvelopeType::Session, 3);
        for m in [&first_log, &second_log, &session] {
            put(&f.store, m);
        }

        // The second log shares the blocked endpoint; the session does not.
        let report = f.service.flush().await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.remaining, 2);
        assert_eq!(f.executor.called(), vec![session.clone(), first_log.clone()]);
        assert!(f
            .tracer
            .states()
            .iter()
            .any(|s| matches!(s, DeliveryTraceState::EndpointBlocked { endpoint: "/v2/logs", .. })));

        f.service.start();
        wait_until("blocked payloads delivered", || f.store.get_payloads_by_priority().is_empty()).await;
        f.service.stop().await;

        let called = f.executor.called();
        assert_eq!(called.len(), 4);
        let mut tail: Vec<_> = called[2..].to_vec();
        tail.sort();
        assert_eq!(tail, vec![first_log, second_log]);
    }

    #[tokio::test]
    async fn test_missing_payload_clears_retry_state() {
        let f = fixture_with(FakeExecutor::succeeding(), fast_policy(3));
        let m = meta(EnvelopeType::Log, 1);
        f.service.retries.insert(
            m.clone(),
            RetryState {
                failed_attempts: 1,
                next_retry_at: Instant::now(),
            },
        );

        f.service.deliver(&m).await;

        assert!(f.executor.called().is_empty());
        assert!(f.service.retries.is_empty());
        assert!(f.tracer.states().contains(&DeliveryTraceState::PayloadMissing {
            filename: m.filename()
        }));
    }

    #[tokio::test]
    async fn test_vanished_payload_retry_state_is_pruned() {
        let f = fixture_with(
            FakeExecutor::new(|_, _| ExecutionResult::transient("HTTP 502")),
            RetryPolicy {
                initial_delay: Duration::from_secs(60),
                ..fast_policy(3)
            },
        );
        let m = meta(EnvelopeType::Log, 1);
        put(&f.store, &m);
        f.service.flush().await;
        assert!(f.service.next_wakeup().is_some());

        f.store.delete(&m, None);
        f.service.flush().await;
        assert!(f.service.next_wakeup().is_none());
    }

    #[tokio::test]
    async fn test_disconnected_defers_until_connectivity_regained() {
        let f = fixture_with(FakeExecutor::succeeding(), fast_policy(3));
        f.service.on_network_connectivity_status_changed(false);
        let m = meta(EnvelopeType::Crash, 1);
        put(&f.store, &m);

        f.service.start();
        f.service.on_payload_intake();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.executor.called().is_empty());

        f.service.on_network_connectivity_status_changed(true);
        wait_until("delivery after reconnect", || f.store.get_payloads_by_priority().is_empty()).await;
        f.service.stop().await;
        assert_eq!(f.executor.called(), vec![m]);
    }

    #[tokio::test]
    async fn test_loop_resumes_on_intake_and_restarts() {
        let f = fixture_with(FakeExecutor::succeeding(), fast_policy(3));
        f.service.start();
        f.service.start();
        assert!(f.service.is_running());

        let first = meta(EnvelopeType::Log, 1);
        put(&f.store, &first);
        f.service.on_payload_intake();
        wait_until("first delivery", || f.executor.called().len() == 1).await;

        f.service.stop().await;
        assert!(!f.service.is_running());

        let second = meta(EnvelopeType::Log, 2);
        put(&f.store, &second);
        f.service.on_payload_intake();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.executor.called().len(), 1);

        f.service.start();
        wait_until("second delivery", || f.executor.called().len() == 2).await;
        f.service.stop().await;
    }
}
