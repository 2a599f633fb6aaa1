//! Payload resurrection service
//!
//! Runs once at startup. Incomplete payloads left in the snapshot store by an
//! earlier process are rebuilt into final payloads and handed to intake for
//! delivery:
//!
//! - SESSION snapshots: unfinished span snapshots become failed spans, the
//!   matching native crash (if any) is sent and its id attached to the
//!   session span.
//! - LOG and NETWORK snapshots are forwarded as they are.
//! - CRASH snapshots only supply envelope data for sessionless native crashes
//!   and are deleted at the end of the run.
//!
//! Failures are per payload. A payload that fails stays on disk for the next
//! run and never blocks the others.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parcel_core::domain::session::{APP_STATE_KEY, CRASH_ID_KEY, HEARTBEAT_TIME_KEY, PROCESS_IDENTIFIER_KEY, SESSION_ID_KEY};
use parcel_core::domain::trace::trace;
use parcel_core::domain::{
    DeliveryTraceState, DeliveryTracer, DomainError, Envelope, EnvelopeType, LogPayload, NativeCrashData,
    NativeCrashEnvelope, SessionPayload, Span, StoredTelemetryMetadata,
};
use parcel_core::ports::{INativeCrashService, IPayloadStore, InternalErrorHandler, InternalErrorType};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, WorkerError};
use crate::intake::IntakeService;

/// App state reported for native crashes that match no session
const BACKGROUND_STATE: &str = "background";

/// Outcome of one resurrection run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResurrectionReport {
    /// Payloads handed to intake for delivery
    pub resurrected: usize,
    /// Payloads left on disk after an error
    pub failed: usize,
    pub native_crashes_sent: usize,
    pub crash_snapshots_deleted: usize,
}

/// Recovers payloads orphaned by a previous process
pub struct PayloadResurrectionService {
    intake: Arc<IntakeService>,
    snapshot_store: Arc<dyn IPayloadStore>,
    error_handler: Arc<dyn InternalErrorHandler>,
    tracer: Option<Arc<DeliveryTracer>>,
}

impl PayloadResurrectionService {
    pub fn new(
        intake: Arc<IntakeService>,
        snapshot_store: Arc<dyn IPayloadStore>,
        error_handler: Arc<dyn InternalErrorHandler>,
    ) -> Self {
        Self {
            intake,
            snapshot_store,
            error_handler,
            tracer: None,
        }
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<DeliveryTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Resurrects every undelivered snapshot
    ///
    /// `native_crashes` is the crash source of the embedding application, if
    /// one is available. Without it sessions are resurrected without crash ids.
    pub async fn resurrect_old_payloads(
        &self,
        native_crashes: Option<Arc<dyn INativeCrashService>>,
    ) -> ResurrectionReport {
        let mut report = ResurrectionReport::default();

        let store = self.snapshot_store.clone();
        let undelivered = match blocking(move || store.get_undelivered_payloads()).await {
            Ok(undelivered) => undelivered,
            Err(e) => {
                self.report_error(InternalErrorType::PayloadResurrectionFail, e, "listing undelivered payloads");
                return report;
            }
        };
        let (crash_snapshots, candidates): (Vec<_>, Vec<_>) = undelivered
            .into_iter()
            .partition(|m| m.envelope_type() == EnvelopeType::Crash);

        trace(
            self.tracer.as_deref(),
            DeliveryTraceState::ResurrectionStarted {
                candidates: candidates.len(),
            },
        );
        info!(
            candidates = candidates.len(),
            crash_snapshots = crash_snapshots.len(),
            "Resurrecting payloads from previous processes"
        );

        let crashes = match &native_crashes {
            Some(service) => {
                let service = service.clone();
                match blocking(move || service.get_native_crashes()).await {
                    Ok(crashes) => crashes,
                    Err(e) => {
                        self.report_error(InternalErrorType::NativeCrashResurrectionError, e, "reading native crashes");
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };
        let mut crashes = NativeCrashes::new(crashes);

        for metadata in &candidates {
            let filename = metadata.filename();
            match self
                .resurrect_payload(metadata, native_crashes.as_ref(), &mut crashes, &mut report)
                .await
            {
                Ok(()) => {
                    self.snapshot_store.delete(metadata, None);
                    report.resurrected += 1;
                    debug!(filename = %filename, "Payload resurrected");
                    trace(self.tracer.as_deref(), DeliveryTraceState::PayloadResurrected { filename });
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(filename = %filename, error = %e, "Payload resurrection failed");
                    trace(
                        self.tracer.as_deref(),
                        DeliveryTraceState::ResurrectionFailed {
                            filename,
                            reason: e.to_string(),
                        },
                    );
                    self.report_error(
                        InternalErrorType::PayloadResurrectionFail,
                        e,
                        "resurrecting and sending incomplete payloads from previous app launches",
                    );
                }
            }
        }

        if let Some(service) = &native_crashes {
            self.send_sessionless_crashes(service, &crashes, crash_snapshots.first(), &mut report)
                .await;
            let service = service.clone();
            if let Err(e) = blocking(move || service.delete_all_native_crashes()).await {
                self.report_error(InternalErrorType::NativeCrashResurrectionError, e, "deleting native crashes");
            }
        }

        for metadata in &crash_snapshots {
            self.snapshot_store.delete(metadata, None);
            report.crash_snapshots_deleted += 1;
        }

        info!(
            resurrected = report.resurrected,
            failed = report.failed,
            native_crashes_sent = report.native_crashes_sent,
            "Resurrection complete"
        );
        report
    }

    async fn resurrect_payload(
        &self,
        metadata: &StoredTelemetryMetadata,
        native_crashes: Option<&Arc<dyn INativeCrashService>>,
        crashes: &mut NativeCrashes,
        report: &mut ResurrectionReport,
    ) -> Result<(), DeliveryError> {
        let final_metadata = metadata.with_complete(true);
        match metadata.envelope_type() {
            EnvelopeType::Session => {
                let dead_session: Envelope<SessionPayload> = self.load(metadata).await?;
                let crash = match (native_crashes, dead_session.session_id()) {
                    (Some(_), Some(session_id)) => crashes.take(session_id),
                    _ => None,
                };
                if let (Some(service), Some(crash)) = (native_crashes, &crash) {
                    self.send_session_crash(service, crash, &dead_session, metadata).await?;
                    report.native_crashes_sent += 1;
                }
                let resurrected = resurrect_session(dead_session, crash.as_ref())?;
                self.intake.take_for_delivery(resurrected, final_metadata).await
            }
            EnvelopeType::Log | EnvelopeType::Network => {
                let envelope: Envelope<serde_json::Value> = self.load(metadata).await?;
                self.intake.take_for_delivery(envelope, final_metadata).await
            }
            EnvelopeType::Crash => Ok(()),
        }
    }

    async fn send_session_crash(
        &self,
        service: &Arc<dyn INativeCrashService>,
        crash: &NativeCrashData,
        dead_session: &Envelope<SessionPayload>,
        metadata: &StoredTelemetryMetadata,
    ) -> Result<(), DeliveryError> {
        let properties = dead_session.session_properties();
        let mut extra = BTreeMap::new();
        if let Some(app_state) = dead_session.session_span().and_then(|s| s.attribute(APP_STATE_KEY)) {
            extra.insert(APP_STATE_KEY.to_string(), app_state.to_string());
            extra.insert(PROCESS_IDENTIFIER_KEY.to_string(), metadata.process_id().to_string());
        }
        info!(
            native_crash_id = %crash.native_crash_id,
            session_id = %crash.session_id,
            "Sending native crash for resurrected session"
        );
        let envelope = NativeCrashEnvelope::from_envelope(dead_session);
        let service = service.clone();
        let crash = crash.clone();
        blocking(move || service.send_native_crash(&crash, Some(&envelope), &properties, &extra)).await
    }

    async fn send_sessionless_crashes(
        &self,
        service: &Arc<dyn INativeCrashService>,
        crashes: &NativeCrashes,
        crash_snapshot: Option<&StoredTelemetryMetadata>,
        report: &mut ResurrectionReport,
    ) {
        let sessionless = crashes.remaining();
        if sessionless.is_empty() {
            return;
        }

        let cached_crash_envelope = match crash_snapshot {
            Some(metadata) => self
                .load::<LogPayload>(metadata)
                .await
                .ok()
                .and_then(|envelope| NativeCrashEnvelope::from_complete_envelope(&envelope)),
            None => None,
        };

        for crash in &sessionless {
            if cached_crash_envelope.is_none() {
                self.error_handler.track_internal_error(
                    InternalErrorType::NativeCrashResurrectionError,
                    &anyhow::anyhow!("Cached native crash envelope data not found"),
                );
            }
            let metadata = BTreeMap::from([(APP_STATE_KEY.to_string(), BACKGROUND_STATE.to_string())]);
            let service = service.clone();
            let crash = (*crash).clone();
            let envelope = cached_crash_envelope.clone();
            info!(native_crash_id = %crash.native_crash_id, "Sending sessionless native crash");
            let send = move || {
                service.send_native_crash(&crash, envelope.as_ref(), &BTreeMap::new(), &metadata)
            };
            match blocking(send).await {
                Ok(()) => report.native_crashes_sent += 1,
                Err(e) => self.report_error(
                    InternalErrorType::NativeCrashResurrectionError,
                    e,
                    "sending sessionless native crash",
                ),
            }
        }

        if sessionless.len() > 1 {
            self.error_handler.track_internal_error(
                InternalErrorType::NativeCrashResurrectionError,
                &anyhow::anyhow!("Multiple sessionless native crashes found ({})", sessionless.len()),
            );
        }
    }

    /// Reads and deserializes a snapshot off the async executor
    async fn load<T>(&self, metadata: &StoredTelemetryMetadata) -> Result<Envelope<T>, DeliveryError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let store = self.snapshot_store.clone();
        let metadata = metadata.clone();
        blocking(move || -> Result<Envelope<T>, DeliveryError> {
            let reader = store
                .load_payload_as_stream(&metadata)
                .ok_or_else(|| DeliveryError::PayloadMissing(metadata.filename()))?;
            Ok(Envelope::from_json_reader(reader)?)
        })
        .await?
    }

    fn report_error(&self, error_type: InternalErrorType, error: DeliveryError, context: &'static str) {
        self.error_handler
            .track_internal_error(error_type, &anyhow::Error::new(error).context(context));
    }
}

/// Native crashes keyed by session id, minus those already matched
struct NativeCrashes {
    by_session: BTreeMap<String, NativeCrashData>,
    processed: HashSet<String>,
}

impl NativeCrashes {
    fn new(crashes: Vec<NativeCrashData>) -> Self {
        Self {
            by_session: crashes.into_iter().map(|c| (c.session_id.clone(), c)).collect(),
            processed: HashSet::new(),
        }
    }

    fn take(&mut self, session_id: &str) -> Option<NativeCrashData> {
        let crash = self.by_session.get(session_id)?.clone();
        self.processed.insert(session_id.to_string());
        Some(crash)
    }

    /// Crashes that matched no resurrected session
    fn remaining(&self) -> Vec<&NativeCrashData> {
        self.by_session
            .iter()
            .filter(|(session_id, _)| !self.processed.contains(*session_id))
            .map(|(_, crash)| crash)
            .collect()
    }
}

/// Rebuilds the final envelope of a session whose process died
///
/// Span snapshots without a completed counterpart become failed spans. When
/// `crash` belongs to this session its id is attached to the session span.
///
/// # Errors
/// [`DomainError::SessionSpanCount`] unless exactly one session span results.
pub fn resurrect_session(
    mut envelope: Envelope<SessionPayload>,
    crash: Option<&NativeCrashData>,
) -> Result<Envelope<SessionPayload>, DomainError> {
    let end_time_ms = failed_span_end_time_ms(&envelope);
    let SessionPayload { spans, span_snapshots } = std::mem::take(&mut envelope.data);

    let mut spans = spans.unwrap_or_default();
    let completed_ids: HashSet<Option<String>> = spans.iter().map(|s| s.span_id.clone()).collect();
    spans.extend(
        span_snapshots
            .unwrap_or_default()
            .iter()
            .filter(|s| !completed_ids.contains(&s.span_id))
            .map(|s| s.to_failed_span(end_time_ms)),
    );

    let session_spans: Vec<usize> = spans
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_session_span())
        .map(|(i, _)| i)
        .collect();
    let &[session_index] = session_spans.as_slice() else {
        return Err(DomainError::SessionSpanCount(session_spans.len()));
    };

    if let Some(crash) = crash {
        spans[session_index] = attach_crash(&spans[session_index], crash);
    }

    Ok(envelope.with_data(SessionPayload {
        spans: Some(spans),
        span_snapshots: Some(Vec::new()),
    }))
}

fn attach_crash(session_span: &Span, crash: &NativeCrashData) -> Span {
    if session_span.attribute(SESSION_ID_KEY) == Some(crash.session_id.as_str()) {
        session_span.with_attribute(CRASH_ID_KEY, &crash.native_crash_id)
    } else {
        session_span.clone()
    }
}

/// Best estimate of when the dead session stopped: the later of the session
/// span's end time and its last heartbeat, or 0 when neither is known
fn failed_span_end_time_ms(envelope: &Envelope<SessionPayload>) -> i64 {
    let Some(session_span) = envelope.session_span() else {
        return 0;
    };
    let end_time = session_span.end_time_nanos.unwrap_or(0);
    let heartbeat = session_span
        .attribute(HEARTBEAT_TIME_KEY)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    end_time.max(heartbeat) / 1_000_000
}

async fn blocking<R, F>(f: F) -> Result<R, DeliveryError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| DeliveryError::Worker(WorkerError::ResultLost("resurrection")))
}
