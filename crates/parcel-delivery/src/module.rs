//! Delivery module bootstrapper
//!
//! Builds every delivery service from a [`Config`] and runs them in order:
//!
//! 1. resurrection of payloads left by a previous process (once)
//! 2. the scheduling loop
//! 3. storage telemetry
//! 4. session snapshot caching, when enabled and a snapshot provider exists
//!
//! [`DeliveryModule::shutdown`] stops them in reverse order and drains the
//! intake lane, so every accepted payload is on disk when it returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use parcel_core::config::Config;
use parcel_core::connectivity::{NetworkConnectivityListener, NetworkConnectivityService};
use parcel_core::data_source::GatedDataSource;
use parcel_core::domain::DeliveryTracer;
use parcel_core::ports::{INativeCrashService, IRequestExecutionService, InternalErrorHandler, TracingErrorHandler};
use parcel_storage::{FilePayloadStorageService, MetricsRegistry, StorageLocation, StorageService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::caching::{PayloadCachingService, SessionSnapshotProvider};
use crate::error::DeliveryError;
use crate::execution::HttpRequestExecutionService;
use crate::intake::IntakeService;
use crate::resurrection::{PayloadResurrectionService, ResurrectionReport};
use crate::retry::RetryPolicy;
use crate::scheduling::SchedulingService;
use crate::worker::PriorityWorker;

type CachingSource = GatedDataSource<PayloadCachingService>;

struct TelemetryTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// All delivery services, wired together
pub struct DeliveryModule {
    config: Mutex<Config>,
    storage: Arc<StorageService>,
    payload_store: Arc<FilePayloadStorageService>,
    snapshot_store: Arc<FilePayloadStorageService>,
    intake: Arc<IntakeService>,
    scheduling: Arc<SchedulingService>,
    resurrection: PayloadResurrectionService,
    connectivity: Arc<NetworkConnectivityService>,
    native_crashes: Option<Arc<dyn INativeCrashService>>,
    caching: Mutex<Option<CachingSource>>,
    metrics: Arc<MetricsRegistry>,
    tracer: Arc<DeliveryTracer>,
    error_handler: Arc<dyn InternalErrorHandler>,
    telemetry: Mutex<Option<TelemetryTask>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl DeliveryModule {
    /// Wires the module with HTTP delivery and internal errors logged
    /// through `tracing`
    ///
    /// Must be called inside a Tokio runtime.
    pub fn from_config(config: Config) -> Result<Self, DeliveryError> {
        let executor = Arc::new(HttpRequestExecutionService::new(&config.delivery)?);
        Self::new(config, executor, Arc::new(TracingErrorHandler))
    }

    /// Wires the module around a custom request execution service
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// [`DeliveryError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: Config,
        executor: Arc<dyn IRequestExecutionService>,
        error_handler: Arc<dyn InternalErrorHandler>,
    ) -> Result<Self, DeliveryError> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(DeliveryError::InvalidConfig(
                problems.iter().map(ToString::to_string).collect(),
            ));
        }

        let metrics = Arc::new(MetricsRegistry::new().map_err(|e| DeliveryError::Metrics(format!("{e:#}")))?);
        let tracer = Arc::new(DeliveryTracer::default());
        let storage = Arc::new(StorageService::from_config(&config.storage));

        let open_store = |location| {
            Arc::new(
                FilePayloadStorageService::new(storage.clone(), location, error_handler.clone())
                    .with_max_bytes(config.storage.max_payload_storage_bytes)
                    .with_retain_dropped(config.delivery.retain_dropped_payloads)
                    .with_metrics(metrics.clone())
                    .with_tracer(tracer.clone()),
            )
        };
        let payload_store = open_store(StorageLocation::Payloads);
        let snapshot_store = open_store(StorageLocation::Snapshots);

        let connectivity = Arc::new(NetworkConnectivityService::new(true));
        let scheduling = Arc::new(
            SchedulingService::new(
                payload_store.clone(),
                executor,
                RetryPolicy::from_config(&config.retry),
                config.delivery.max_concurrent_deliveries,
                error_handler.clone(),
            )
            .with_metrics(metrics.clone())
            .with_tracer(tracer.clone())
            .with_initial_connectivity(connectivity.is_connected()),
        );
        connectivity.add_listener(scheduling.clone());

        let intake = Arc::new(
            IntakeService::new(
                payload_store.clone(),
                snapshot_store.clone(),
                scheduling.clone(),
                Arc::new(PriorityWorker::new("intake")),
                error_handler.clone(),
            )
            .with_tracer(tracer.clone()),
        );
        let resurrection = PayloadResurrectionService::new(intake.clone(), snapshot_store.clone(), error_handler.clone())
            .with_tracer(tracer.clone());

        info!(
            files_dir = %config.storage.files_dir.display(),
            endpoint = %config.delivery.endpoint,
            "Delivery module initialized"
        );

        Ok(Self {
            config: Mutex::new(config),
            storage,
            payload_store,
            snapshot_store,
            intake,
            scheduling,
            resurrection,
            connectivity,
            native_crashes: None,
            caching: Mutex::new(None),
            metrics,
            tracer,
            error_handler,
            telemetry: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Source of native crashes recorded by earlier processes
    #[must_use]
    pub fn with_native_crash_service(mut self, service: Arc<dyn INativeCrashService>) -> Self {
        self.native_crashes = Some(service);
        self
    }

    /// Enables periodic snapshots of the in-progress session, gated on
    /// `caching.enabled`
    #[must_use]
    pub fn with_session_provider(self, provider: Arc<dyn SessionSnapshotProvider>) -> Self {
        let intake = self.intake.clone();
        let source = GatedDataSource::new(
            "payload_caching",
            |config: &Config| config.caching.enabled,
            move |config: &Config| {
                let interval = config.caching.interval();
                PayloadCachingService::start(intake.clone(), provider.clone(), interval)
            },
        );
        *lock(&self.caching) = Some(source);
        self
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Resurrects old payloads, then starts delivery, storage telemetry and
    /// snapshot caching
    ///
    /// A module that has been shut down cannot be started again.
    pub async fn start(&self) -> ResurrectionReport {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("Delivery module was shut down and cannot be restarted");
            return ResurrectionReport::default();
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Delivery module already started");
            return ResurrectionReport::default();
        }

        let report = self.resurrect().await;
        self.scheduling.start();
        self.start_storage_telemetry();

        let config = lock(&self.config).clone();
        if let Some(caching) = lock(&self.caching).as_mut() {
            caching.on_config_change(&config);
        }
        info!(resurrected = report.resurrected, "Delivery module started");
        report
    }

    /// Runs resurrection on its own, without starting any service
    pub async fn resurrect(&self) -> ResurrectionReport {
        self.resurrection
            .resurrect_old_payloads(self.native_crashes.clone())
            .await
    }

    /// Stops every service in reverse start order
    ///
    /// In-flight deliveries and submitted intake writes complete first.
    /// Shutdown is final: intake stays closed and later calls to
    /// [`start`](Self::start) are refused.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(caching) = lock(&self.caching).as_mut() {
            caching.disable();
        }

        let telemetry = lock(&self.telemetry).take();
        if let Some(telemetry) = telemetry {
            telemetry.cancel.cancel();
            if let Err(e) = telemetry.task.await {
                warn!(error = %e, "Storage telemetry task failed");
            }
        }

        self.scheduling.stop().await;
        self.intake.shutdown().await;

        let listener: Arc<dyn NetworkConnectivityListener> = self.scheduling.clone();
        self.connectivity.remove_listener(&listener);
        info!("Delivery module shut down");
    }

    /// Applies a new configuration to the config-gated data sources
    ///
    /// Before [`start`](Self::start) the configuration is only recorded.
    pub fn on_config_change(&self, config: &Config) {
        *lock(&self.config) = config.clone();
        if !self.started.load(Ordering::SeqCst) || self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if let Some(caching) = lock(&self.caching).as_mut() {
            caching.on_config_change(config);
        }
    }

    fn start_storage_telemetry(&self) {
        let interval = lock(&self.config).storage.telemetry_interval();
        let cancel = CancellationToken::new();
        let task = self.storage.clone().spawn_storage_telemetry(
            self.metrics.clone(),
            interval,
            self.error_handler.clone(),
            cancel.clone(),
        );
        *lock(&self.telemetry) = Some(TelemetryTask { cancel, task });
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn intake(&self) -> &Arc<IntakeService> {
        &self.intake
    }

    pub fn scheduling(&self) -> &Arc<SchedulingService> {
        &self.scheduling
    }

    /// Connectivity source; the host reports network transitions here
    pub fn connectivity(&self) -> &Arc<NetworkConnectivityService> {
        &self.connectivity
    }

    pub fn payload_store(&self) -> &Arc<FilePayloadStorageService> {
        &self.payload_store
    }

    pub fn snapshot_store(&self) -> &Arc<FilePayloadStorageService> {
        &self.snapshot_store
    }

    pub fn storage(&self) -> &Arc<StorageService> {
        &self.storage
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn tracer(&self) -> &Arc<DeliveryTracer> {
        &self.tracer
    }

    /// Whether the snapshot caching service is currently running
    pub fn is_caching(&self) -> bool {
        lock(&self.caching)
            .as_ref()
            .is_some_and(|c| c.state().is_enabled())
    }

    pub fn config(&self) -> Config {
        lock(&self.config).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
