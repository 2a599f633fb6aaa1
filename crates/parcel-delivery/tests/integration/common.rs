//! Shared helpers for delivery integration tests
//!
//! Provides a wiremock collector, a module configuration pointing at it and
//! helpers to decode what the collector received.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use flate2::read::GzDecoder;
use parcel_core::config::Config;
use parcel_delivery::HttpRequestExecutionService;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Starts a collector and returns an execution service pointed at it
pub async fn setup_collector() -> (MockServer, HttpRequestExecutionService) {
    let server = MockServer::start().await;
    let service = HttpRequestExecutionService::with_base_url(server.uri());
    (server, service)
}

/// Answers every POST to `endpoint` with `status`
pub async fn mount_status(server: &MockServer, endpoint: &str, status: u16) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Accepts everything on both endpoints
pub async fn mount_accept_all(server: &MockServer) {
    mount_status(server, "/v2/logs", 202).await;
    mount_status(server, "/v2/spans", 202).await;
}

/// Module configuration storing under `root` and delivering to `server`
pub fn module_config(root: &Path, server: &MockServer) -> Config {
    let mut config = Config::default();
    config.storage.files_dir = root.join("files");
    config.storage.cache_dir = root.join("cache");
    config.delivery.endpoint = server.uri();
    config.delivery.app_id = Some("app-test".to_string());
    config.retry.initial_delay_secs = 1;
    config.retry.max_delay_secs = 1;
    config.caching.enabled = false;
    config
}

/// Decompresses a gzip request body into JSON
pub fn json_body(request: &Request) -> serde_json::Value {
    let mut body = String::new();
    GzDecoder::new(request.body.as_slice())
        .read_to_string(&mut body)
        .expect("request body is not gzip");
    serde_json::from_str(&body).expect("request body is not JSON")
}

/// Requests received on `endpoint` so far
pub async fn requests_to(server: &MockServer, endpoint: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == endpoint)
        .collect()
}

/// Polls until `endpoint` has received `count` requests
pub async fn wait_for_requests(server: &MockServer, endpoint: &str, count: usize) -> Vec<Request> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let requests = requests_to(server, endpoint).await;
        if requests.len() >= count {
            return requests;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {count} requests to {endpoint}, got {}",
            requests.len()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
