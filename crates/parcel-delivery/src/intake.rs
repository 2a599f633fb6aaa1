//! Intake service
//!
//! The single entry point producers use to hand over envelopes.
//!
//! ```text
//!   take(envelope, complete)      ──► payload store ──► scheduling notified
//!   take(envelope, !complete)     ──► snapshot store (one cached entry per type)
//!   take_for_delivery(envelope)   ──► payload store ──► scheduling notified
//! ```
//!
//! Every write runs on the priority lane, so writes for the same key are
//! applied one after another in submission order and never interleave.
//! A successful return means the payload is durable on disk.

use std::sync::{Arc, Mutex};

use parcel_core::domain::trace::trace;
use parcel_core::domain::{DeliveryTraceState, DeliveryTracer, Envelope, EnvelopeType, StoredTelemetryMetadata};
use parcel_core::ports::{IPayloadStore, ISchedulingService, InternalErrorHandler, InternalErrorType};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::DeliveryError;
use crate::worker::PriorityWorker;

/// Most recent cached snapshot per envelope type
#[derive(Debug, Default)]
struct CachedEntries {
    session: Option<StoredTelemetryMetadata>,
    crash: Option<StoredTelemetryMetadata>,
}

impl CachedEntries {
    fn slot(&mut self, envelope_type: EnvelopeType) -> Option<&mut Option<StoredTelemetryMetadata>> {
        match envelope_type {
            EnvelopeType::Session => Some(&mut self.session),
            EnvelopeType::Crash => Some(&mut self.crash),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Intake,
    ForDelivery,
}

/// Everything a lane job needs, cloned into each job
#[derive(Clone)]
struct IntakeContext {
    payload_store: Arc<dyn IPayloadStore>,
    snapshot_store: Arc<dyn IPayloadStore>,
    scheduling: Arc<dyn ISchedulingService>,
    error_handler: Arc<dyn InternalErrorHandler>,
    tracer: Option<Arc<DeliveryTracer>>,
    cached: Arc<Mutex<CachedEntries>>,
}

/// Accepts envelopes from producers and persists them for delivery
pub struct IntakeService {
    ctx: IntakeContext,
    lane: Arc<PriorityWorker>,
}

impl IntakeService {
    pub fn new(
        payload_store: Arc<dyn IPayloadStore>,
        snapshot_store: Arc<dyn IPayloadStore>,
        scheduling: Arc<dyn ISchedulingService>,
        lane: Arc<PriorityWorker>,
        error_handler: Arc<dyn InternalErrorHandler>,
    ) -> Self {
        Self {
            ctx: IntakeContext {
                payload_store,
                snapshot_store,
                scheduling,
                error_handler,
                tracer: None,
                cached: Arc::new(Mutex::new(CachedEntries::default())),
            },
            lane,
        }
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<DeliveryTracer>) -> Self {
        self.ctx.tracer = Some(tracer);
        self
    }

    /// Persists `envelope` under `metadata`
    ///
    /// Complete payloads go to the payload store and wake the scheduler.
    /// Incomplete ones replace the cached snapshot of their type.
    ///
    /// # Errors
    /// Returns the storage or lane failure. It is also reported to the
    /// internal error handler, so producers may ignore it.
    pub async fn take<T>(&self, envelope: Envelope<T>, metadata: StoredTelemetryMetadata) -> Result<(), DeliveryError>
    where
        T: Serialize + Send + 'static,
    {
        self.submit(envelope, metadata, Route::Intake).await
    }

    /// Persists a finished `envelope` straight into the payload store and
    /// wakes the scheduler, skipping snapshot bookkeeping
    pub async fn take_for_delivery<T>(
        &self,
        envelope: Envelope<T>,
        metadata: StoredTelemetryMetadata,
    ) -> Result<(), DeliveryError>
    where
        T: Serialize + Send + 'static,
    {
        self.submit(envelope, metadata, Route::ForDelivery).await
    }

    /// Waits for every submitted write, then rejects new ones
    pub async fn shutdown(&self) {
        self.lane.shutdown_and_wait().await;
        info!("Intake service shut down");
    }

    async fn submit<T>(
        &self,
        envelope: Envelope<T>,
        metadata: StoredTelemetryMetadata,
        route: Route,
    ) -> Result<(), DeliveryError>
    where
        T: Serialize + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let job_metadata = metadata.clone();
        let result = self
            .lane
            .run_job(metadata.priority(), move || ctx.persist(&envelope, &job_metadata, route))
            .await
            .map_err(DeliveryError::from)
            .and_then(|r| r);

        if let Err(e) = &result {
            self.ctx.error_handler.track_internal_error(
                InternalErrorType::IntakeFail,
                &anyhow::anyhow!("{e}").context(format!("taking {}", metadata.filename())),
            );
        }
        result
    }
}

impl IntakeContext {
    fn persist<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
        metadata: &StoredTelemetryMetadata,
        route: Route,
    ) -> Result<(), DeliveryError> {
        let to_payloads = route == Route::ForDelivery || metadata.complete();
        self.record(DeliveryTraceState::IntakeAccepted {
            filename: metadata.filename(),
            complete: to_payloads,
        });

        let store = if to_payloads {
            &self.payload_store
        } else {
            &self.snapshot_store
        };
        let bytes = serde_json::to_vec(envelope)?;
        store.store(metadata, Box::new(move |writer| writer.write_all(&bytes)))?;

        match (route, to_payloads) {
            (Route::Intake, true) => {
                if metadata.envelope_type() == EnvelopeType::Session {
                    let previous = self.lock_cached().session.take();
                    if let Some(previous) = previous {
                        self.supersede(&previous);
                    }
                }
                self.scheduling.on_payload_intake();
            }
            (Route::Intake, false) => self.cache_snapshot(metadata),
            (Route::ForDelivery, _) => self.scheduling.on_payload_intake(),
        }
        Ok(())
    }

    fn cache_snapshot(&self, metadata: &StoredTelemetryMetadata) {
        let replaced = self
            .lock_cached()
            .slot(metadata.envelope_type())
            .map(|slot| slot.replace(metadata.clone()));
        let previous = match replaced {
            Some(previous) => previous,
            None => {
                self.error_handler.track_internal_error(
                    InternalErrorType::IntakeUnexpectedType,
                    &anyhow::anyhow!(
                        "incomplete {} payload stored as a snapshot",
                        metadata.envelope_type()
                    ),
                );
                None
            }
        };
        if let Some(previous) = previous.filter(|p| p.filename() != metadata.filename()) {
            self.supersede(&previous);
        }
        debug!(filename = %metadata.filename(), "Snapshot cached");
        self.record(DeliveryTraceState::SnapshotCached {
            filename: metadata.filename(),
        });
    }

    fn supersede(&self, previous: &StoredTelemetryMetadata) {
        self.snapshot_store.delete(previous, None);
        self.record(DeliveryTraceState::SnapshotSuperseded {
            filename: previous.filename(),
        });
    }

    fn lock_cached(&self) -> std::sync::MutexGuard<'_, CachedEntries> {
        match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, state: DeliveryTraceState) {
        trace(self.tracer.as_deref(), state);
    }
}
