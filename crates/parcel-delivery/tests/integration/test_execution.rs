//! Integration tests for the HTTP request execution service
//!
//! Verifies request shape (URL, headers, gzip body) and how collector
//! responses are classified.

use std::time::Duration;

use parcel_core::domain::{EnvelopeType, StoredTelemetryMetadata};
use parcel_core::ports::{ExecutionResult, IRequestExecutionService};
use parcel_delivery::HttpRequestExecutionService;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common;

fn log_metadata() -> StoredTelemetryMetadata {
    StoredTelemetryMetadata::for_current_process(EnvelopeType::Log, true)
}

#[tokio::test]
async fn test_posts_gzip_json_with_headers() {
    let (server, service) = common::setup_collector().await;
    let service = service.with_identity(Some("app-1".to_string()), Some("device-1".to_string()));
    Mock::given(method("POST"))
        .and(path("/v2/logs"))
        .and(header("content-encoding", "gzip"))
        .and(header("content-type", "application/json"))
        .and(header("x-app-id", "app-1"))
        .and(header("x-device-id", "device-1"))
        .and(header("x-payload-type", "log"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let payload = br#"{"data":{"logs":[{"body":"hello"}]}}"#.to_vec();
    let result = service.execute(payload, &log_metadata()).await;
    assert_eq!(result, ExecutionResult::Success);

    let requests = common::requests_to(&server, "/v2/logs").await;
    assert_eq!(requests.len(), 1);
    let body = common::json_body(&requests[0]);
    assert_eq!(body["data"]["logs"][0]["body"], "hello");
    let user_agent = requests[0].headers.get("user-agent").unwrap().to_str().unwrap();
    assert!(user_agent.starts_with("parcel/"));
}

#[tokio::test]
async fn test_session_goes_to_spans_endpoint() {
    let (server, service) = common::setup_collector().await;
    common::mount_accept_all(&server).await;

    let metadata = StoredTelemetryMetadata::for_current_process(EnvelopeType::Session, true);
    let result = service.execute(b"{}".to_vec(), &metadata).await;
    assert_eq!(result, ExecutionResult::Success);
    assert_eq!(common::requests_to(&server, "/v2/spans").await.len(), 1);
    assert!(common::requests_to(&server, "/v2/logs").await.is_empty());
}

#[tokio::test]
async fn test_too_many_requests_carries_retry_after() {
    let (server, service) = common::setup_collector().await;
    Mock::given(method("POST"))
        .and(path("/v2/logs"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
        .mount(&server)
        .await;

    let result = service.execute(b"{}".to_vec(), &log_metadata()).await;
    assert_eq!(
        result,
        ExecutionResult::TransientFailure {
            reason: "HTTP 429".to_string(),
            retry_after: Some(Duration::from_secs(120)),
        }
    );
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let (server, service) = common::setup_collector().await;
    common::mount_status(&server, "/v2/logs", 503).await;

    let result = service.execute(b"{}".to_vec(), &log_metadata()).await;
    assert_eq!(result, ExecutionResult::transient("HTTP 503"));
}

#[tokio::test]
async fn test_client_error_is_permanent() {
    let (server, service) = common::setup_collector().await;
    common::mount_status(&server, "/v2/logs", 400).await;

    let result = service.execute(b"{}".to_vec(), &log_metadata()).await;
    assert_eq!(result, ExecutionResult::permanent("HTTP 400"));
}

#[tokio::test]
async fn test_unreachable_collector_is_transient() {
    let (server, _) = common::setup_collector().await;
    let uri = server.uri();
    drop(server);

    let service = HttpRequestExecutionService::with_base_url(uri);
    let result = service.execute(b"{}".to_vec(), &log_metadata()).await;
    assert!(
        matches!(result, ExecutionResult::TransientFailure { retry_after: None, .. }),
        "unexpected result: {result:?}"
    );
}
