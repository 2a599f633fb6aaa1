//! Request execution port (driven/secondary port)
//!
//! Sends one payload to the backend and classifies the outcome. The
//! scheduling service depends only on the three-way [`ExecutionResult`].

use std::time::Duration;

use crate::domain::StoredTelemetryMetadata;

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Success,
    /// Worth retrying later. `retry_after` is set when the server asked for
    /// a specific pause (HTTP 429).
    TransientFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Retrying cannot help; the payload is dropped
    PermanentFailure { reason: String },
}

impl ExecutionResult {
    pub fn transient(reason: impl Into<String>) -> Self {
        ExecutionResult::TransientFailure {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        ExecutionResult::PermanentFailure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success)
    }

    /// Short label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Success => "success",
            ExecutionResult::TransientFailure { .. } => "transient_failure",
            ExecutionResult::PermanentFailure { .. } => "permanent_failure",
        }
    }
}

/// Delivers payload bytes to the backend
///
/// Implementations own their timeouts; the scheduler never cancels an
/// attempt once started.
#[async_trait::async_trait]
pub trait IRequestExecutionService: Send + Sync {
    /// Sends `payload`, the uncompressed JSON envelope described by `metadata`
    async fn execute(&self, payload: Vec<u8>, metadata: &StoredTelemetryMetadata) -> ExecutionResult;
}
