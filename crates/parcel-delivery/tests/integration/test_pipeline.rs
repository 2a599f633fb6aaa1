//! End-to-end tests of the delivery module against a mock collector
//!
//! Payloads go through intake (or resurrection), land on disk and are
//! delivered by the scheduling loop over real HTTP.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parcel_core::domain::session::{CRASH_ID_KEY, EMB_TYPE_KEY, SESSION_ID_KEY, SESSION_SPAN_TYPE};
use parcel_core::domain::{
    Attribute, Envelope, EnvelopeType, Log, LogPayload, NativeCrashData, NativeCrashEnvelope,
    SessionPayload, Span, StoredTelemetryMetadata,
};
use parcel_core::ports::{INativeCrashService, IPayloadStore, RecordingErrorHandler};
use parcel_delivery::DeliveryModule;
use parcel_storage::{FilePayloadStorageService, StorageLocation, StorageService};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn log_envelope(body: &str) -> Envelope<LogPayload> {
    Envelope::new(LogPayload {
        logs: Some(vec![Log {
            body: Some(body.to_string()),
            ..Default::default()
        }]),
    })
    .with_payload_type("logs")
}

fn session_snapshot(session_id: &str) -> Envelope<SessionPayload> {
    Envelope::new(SessionPayload {
        spans: None,
        span_snapshots: Some(vec![Span {
            span_id: Some("session".to_string()),
            name: Some("emb-session".to_string()),
            attributes: Some(vec![
                Attribute::new(EMB_TYPE_KEY, SESSION_SPAN_TYPE),
                Attribute::new(SESSION_ID_KEY, session_id),
            ]),
            ..Default::default()
        }]),
    })
    .with_payload_type("spans")
}

async fn started_module(root: &std::path::Path, server: &MockServer) -> DeliveryModule {
    let module = DeliveryModule::from_config(common::module_config(root, server)).expect("module");
    module.start().await;
    module
}

#[tokio::test]
async fn test_intake_is_delivered_and_removed() {
    let root = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    common::mount_accept_all(&server).await;
    let module = started_module(root.path(), &server).await;

    module
        .intake()
        .take(
            log_envelope("hello"),
            StoredTelemetryMetadata::for_current_process(EnvelopeType::Log, true),
        )
        .await
        .unwrap();

    let requests = common::wait_for_requests(&server, "/v2/logs", 1).await;
    assert_eq!(common::json_body(&requests[0])["data"]["logs"][0]["body"], "hello");
    assert_eq!(requests[0].headers.get("x-app-id").unwrap().to_str().unwrap(), "app-test");

    wait_until(|| module.payload_store().get_payloads_by_priority().is_empty()).await;
    module.shutdown().await;
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let root = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/logs"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    common::mount_status(&server, "/v2/logs", 202).await;
    let module = started_module(root.path(), &server).await;

    module
        .intake()
        .take(
            log_envelope("retry me"),
            StoredTelemetryMetadata::for_current_process(EnvelopeType::Log, true),
        )
        .await
        .unwrap();

    common::wait_for_requests(&server, "/v2/logs", 2).await;
    wait_until(|| module.payload_store().get_payloads_by_priority().is_empty()).await;
    assert!(module.payload_store().get_dropped_payloads().is_empty());

    let metrics = module.metrics().encode().unwrap();
    assert!(metrics.contains("parcel_delivery_attempts_total"));
    module.shutdown().await;
}

#[tokio::test]
async fn test_rejected_payload_is_quarantined() {
    let root = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    common::mount_status(&server, "/v2/logs", 400).await;
    let module = started_module(root.path(), &server).await;

    let metadata = StoredTelemetryMetadata::for_current_process(EnvelopeType::Log, true);
    module.intake().take(log_envelope("bad"), metadata.clone()).await.unwrap();

    wait_until(|| module.payload_store().get_dropped_payloads() == vec![metadata.clone()]).await;
    assert!(module.payload_store().get_payloads_by_priority().is_empty());
    module.shutdown().await;

    // A quarantined payload is never offered again.
    assert_eq!(common::requests_to(&server, "/v2/logs").await.len(), 1);
}

#[derive(Default)]
struct FakeNativeCrashes {
    crashes: Vec<NativeCrashData>,
    sent: Mutex<Vec<String>>,
}

impl INativeCrashService for FakeNativeCrashes {
    fn get_native_crashes(&self) -> Vec<NativeCrashData> {
        self.crashes.clone()
    }

    fn send_native_crash(
        &self,
        crash: &NativeCrashData,
        _envelope: Option<&NativeCrashEnvelope>,
        _session_properties: &BTreeMap<String, String>,
        _metadata: &BTreeMap<String, String>,
    ) {
        self.sent.lock().unwrap().push(crash.native_crash_id.clone());
    }

    fn delete_all_native_crashes(&self) {}
}

#[tokio::test]
async fn test_dead_session_is_resurrected_and_delivered() {
    let root = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    common::mount_accept_all(&server).await;
    let config = common::module_config(root.path(), &server);

    let leftover = StoredTelemetryMetadata::new(1000, "leftover", "deadprocess", EnvelopeType::Session, false).unwrap();
    {
        let storage = Arc::new(StorageService::from_config(&config.storage));
        let snapshots = FilePayloadStorageService::new(
            storage,
            StorageLocation::Snapshots,
            Arc::new(RecordingErrorHandler::new()),
        );
        let bytes = session_snapshot("dead-session").to_json_bytes().unwrap();
        snapshots.store(&leftover, Box::new(move |w| w.write_all(&bytes))).unwrap();
    }

    let crashes = Arc::new(FakeNativeCrashes {
        crashes: vec![NativeCrashData::new("ndk-1", "dead-session", 900)],
        ..Default::default()
    });
    let module = DeliveryModule::from_config(config)
        .unwrap()
        .with_native_crash_service(crashes.clone());

    let report = module.start().await;
    assert_eq!(report.resurrected, 1);
    assert_eq!(*crashes.sent.lock().unwrap(), vec!["ndk-1".to_string()]);

    let requests = common::wait_for_requests(&server, "/v2/spans", 1).await;
    let body = common::json_body(&requests[0]);
    let spans = body["data"]["spans"].as_array().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0]["status"], "ERROR");
    let crash_id = spans[0]["attributes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["key"] == CRASH_ID_KEY)
        .map(|a| a["data"].clone());
    assert_eq!(crash_id, Some(serde_json::json!("ndk-1")));

    assert!(module.snapshot_store().get_payloads_by_priority().is_empty());
    wait_until(|| module.payload_store().get_payloads_by_priority().is_empty()).await;
    module.shutdown().await;
}
