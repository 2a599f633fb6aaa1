//! Payload caching service
//!
//! While a session is in progress its envelope is snapshotted every
//! `caching.interval_ms` and handed to intake as an incomplete payload. All
//! snapshots of one session share the same metadata, so each one overwrites
//! the single cached entry for that session. If the process dies, the last
//! snapshot is what resurrection recovers.
//!
//! The service is a config-gated [`DataSource`]: disabling it stops the
//! timer, and a snapshot already submitted still completes on the intake lane.
//! A snapshot intake rejects is already reported by intake itself.

use std::sync::Arc;
use std::time::Duration;

use parcel_core::data_source::DataSource;
use parcel_core::domain::{Envelope, EnvelopeType, SessionPayload, StoredTelemetryMetadata};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::intake::IntakeService;

/// Supplies the envelope of the session currently in progress
pub trait SessionSnapshotProvider: Send + Sync {
    /// Current state of the active session, or `None` when no session is active
    fn snapshot(&self) -> Option<Envelope<SessionPayload>>;
}

/// Metadata reused for every snapshot of one session
#[derive(Debug, Default)]
struct SnapshotSlot {
    session_id: Option<String>,
    metadata: Option<StoredTelemetryMetadata>,
}

impl SnapshotSlot {
    /// Metadata for `session_id`, minted on the first snapshot of a session
    fn metadata_for(&mut self, session_id: Option<&str>) -> StoredTelemetryMetadata {
        match &self.metadata {
            Some(metadata) if self.session_id.as_deref() == session_id => metadata.clone(),
            _ => {
                let metadata = StoredTelemetryMetadata::for_current_process(EnvelopeType::Session, false);
                self.session_id = session_id.map(str::to_string);
                self.metadata = Some(metadata.clone());
                metadata
            }
        }
    }
}

/// Periodically caches the in-progress session
pub struct PayloadCachingService {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PayloadCachingService {
    /// Starts snapshotting every `interval`
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(
        intake: Arc<IntakeService>,
        provider: Arc<dyn SessionSnapshotProvider>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Session snapshot caching started");
            let mut slot = SnapshotSlot::default();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        cache_once(&intake, provider.as_ref(), &mut slot).await;
                    }
                }
            }
            info!("Session snapshot caching stopped");
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops the timer and waits for the current snapshot, if any
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl DataSource for PayloadCachingService {
    fn disable(&mut self) {
        self.cancel.cancel();
        self.task = None;
    }
}

impl Drop for PayloadCachingService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn cache_once(
    intake: &IntakeService,
    provider: &dyn SessionSnapshotProvider,
    slot: &mut SnapshotSlot,
) {
    let Some(envelope) = provider.snapshot() else {
        return;
    };
    let metadata = slot.metadata_for(envelope.session_id());
    debug!(filename = %metadata.filename(), "Caching session snapshot");
    if let Err(e) = intake.take(envelope, metadata).await {
        warn!(error = %e, "Session snapshot not cached");
    }
}
