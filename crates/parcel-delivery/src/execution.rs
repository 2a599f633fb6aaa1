//! HTTP request execution service
//!
//! POSTs gzip-compressed payloads to `{base_url}/v2/logs` or
//! `{base_url}/v2/spans` and classifies the outcome:
//!
//! | Response                      | Result                              |
//! |-------------------------------|-------------------------------------|
//! | 2xx                           | `Success`                           |
//! | 429                           | `TransientFailure` with Retry-After |
//! | 408, 5xx                      | `TransientFailure`                  |
//! | 413, other 4xx                | `PermanentFailure`                  |
//! | connect / timeout / transport | `TransientFailure`                  |
//! | anything else                 | `TransientFailure`                  |

use async_trait::async_trait;
use parcel_core::config::DeliveryConfig;
use parcel_core::domain::StoredTelemetryMetadata;
use parcel_core::ports::{ExecutionResult, IRequestExecutionService};
use parcel_storage::compression::compress_if_needed;
use reqwest::header::{ACCEPT, CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::retry::parse_retry_after;

const USER_AGENT_VALUE: &str = concat!("parcel/", env!("CARGO_PKG_VERSION"));

/// Delivers payloads to the telemetry backend over HTTP
#[derive(Debug, Clone)]
pub struct HttpRequestExecutionService {
    client: Client,
    base_url: String,
    app_id: Option<String>,
    device_id: Option<String>,
}

impl HttpRequestExecutionService {
    /// Builds a client with the configured endpoint and timeouts
    pub fn new(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.endpoint.clone(),
            app_id: config.app_id.clone(),
            device_id: config.device_id.clone(),
        })
    }

    /// Creates a service with default timeouts against `base_url` (useful for testing)
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            app_id: None,
            device_id: None,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, app_id: Option<String>, device_id: Option<String>) -> Self {
        self.app_id = app_id;
        self.device_id = device_id;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL a payload of this metadata is sent to
    pub fn url_for(&self, metadata: &StoredTelemetryMetadata) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            metadata.envelope_type().endpoint().path()
        )
    }
}

#[async_trait]
impl IRequestExecutionService for HttpRequestExecutionService {
    async fn execute(&self, payload: Vec<u8>, metadata: &StoredTelemetryMetadata) -> ExecutionResult {
        let body = match compress_if_needed(&payload) {
            Ok(body) => body,
            Err(e) => return ExecutionResult::permanent(format!("failed to compress payload: {e}")),
        };
        let url = self.url_for(metadata);

        let mut request = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header("X-Payload-Type", metadata.envelope_type().description())
            .body(body);
        if let Some(app_id) = &self.app_id {
            request = request.header("X-App-Id", app_id);
        }
        if let Some(device_id) = &self.device_id {
            request = request.header("X-Device-Id", device_id);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Delivery request failed");
                let kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection failed"
                } else {
                    "transport error"
                };
                return ExecutionResult::transient(format!("{kind}: {e}"));
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let result = classify_response(status, retry_after.as_deref());
        debug!(
            url = %url,
            status = status.as_u16(),
            result = result.label(),
            "Delivery response received"
        );
        result
    }
}

/// Maps an HTTP status (and `Retry-After` for 429) to an [`ExecutionResult`]
pub fn classify_response(status: StatusCode, retry_after: Option<&str>) -> ExecutionResult {
    let reason = format!("HTTP {}", status.as_u16());
    if status.is_success() {
        return ExecutionResult::Success;
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => ExecutionResult::TransientFailure {
            reason,
            retry_after: retry_after.and_then(parse_retry_after),
        },
        StatusCode::REQUEST_TIMEOUT => ExecutionResult::transient(reason),
        StatusCode::PAYLOAD_TOO_LARGE => ExecutionResult::permanent(reason),
        s if s.is_server_error() => ExecutionResult::transient(reason),
        s if s.is_client_error() => ExecutionResult::permanent(reason),
        _ => ExecutionResult::transient(reason),
    }
}
