//! Internal diagnostics port
//!
//! Faults inside the delivery pipeline never reach producers. They end up
//! here, tagged with the operation that failed.

use std::fmt;
use std::sync::Mutex;

use tracing::error;

/// Operation during which an internal error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalErrorType {
    IntakeFail,
    /// An incomplete payload of a type that has no cache slot
    IntakeUnexpectedType,
    PayloadStoreFail,
    PayloadLoadFail,
    PayloadDeleteFail,
    PayloadEvictionFail,
    PayloadDropFail,
    PayloadResurrectionFail,
    NativeCrashResurrectionError,
    DeliveryFail,
    StorageTelemetryFail,
}

impl InternalErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            InternalErrorType::IntakeFail => "intake_fail",
            InternalErrorType::IntakeUnexpectedType => "intake_unexpected_type",
            InternalErrorType::PayloadStoreFail => "payload_store_fail",
            InternalErrorType::PayloadLoadFail => "payload_load_fail",
            InternalErrorType::PayloadDeleteFail => "payload_delete_fail",
            InternalErrorType::PayloadEvictionFail => "payload_eviction_fail",
            InternalErrorType::PayloadDropFail => "payload_drop_fail",
            InternalErrorType::PayloadResurrectionFail => "payload_resurrection_fail",
            InternalErrorType::NativeCrashResurrectionError => "native_crash_resurrection_error",
            InternalErrorType::DeliveryFail => "delivery_fail",
            InternalErrorType::StorageTelemetryFail => "storage_telemetry_fail",
        }
    }
}

impl fmt::Display for InternalErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives internal errors
pub trait InternalErrorHandler: Send + Sync {
    fn track_internal_error(&self, error_type: InternalErrorType, error: &anyhow::Error);
}

/// Logs internal errors with `tracing::error!`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorHandler;

impl InternalErrorHandler for TracingErrorHandler {
    fn track_internal_error(&self, error_type: InternalErrorType, error: &anyhow::Error) {
        error!(error_type = %error_type, error = %format!("{error:#}"), "Internal error");
    }
}

/// Keeps every internal error in memory, for inspection by tests and tools
#[derive(Debug, Default)]
pub struct RecordingErrorHandler {
    errors: Mutex<Vec<(InternalErrorType, String)>>,
}

impl RecordingErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded errors as `(type, rendered message)` pairs
    pub fn errors(&self) -> Vec<(InternalErrorType, String)> {
        match self.errors.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn types(&self) -> Vec<InternalErrorType> {
        self.errors().into_iter().map(|(t, _)| t).collect()
    }
}

impl InternalErrorHandler for RecordingErrorHandler {
    fn track_internal_error(&self, error_type: InternalErrorType, error: &anyhow::Error) {
        let mut errors = match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        errors.push((error_type, format!("{error:#}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_handler_keeps_order() {
        let handler = RecordingErrorHandler::new();
        handler.track_internal_error(InternalErrorType::IntakeFail, &anyhow::anyhow!("disk full"));
        handler.track_internal_error(
            InternalErrorType::PayloadLoadFail,
            &anyhow::anyhow!("gone").context("loading a.json"),
        );

        let errors = handler.errors();
        assert_eq!(errors[0], (InternalErrorType::IntakeFail, "disk full".to_string()));
        assert_eq!(errors[1].1, "loading a.json: gone");
    }

    #[test]
    fn test_type_labels() {
        assert_eq!(InternalErrorType::IntakeUnexpectedType.to_string(), "intake_unexpected_type");
    }
}
