//! Delivery error types

use parcel_core::domain::DomainError;
use parcel_core::ports::StorageError;
use thiserror::Error;

/// Errors raised by the worker lanes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The lane no longer accepts work
    #[error("Worker lane '{0}' has shut down")]
    ShutDown(&'static str),

    /// The job panicked before producing a result
    #[error("Worker lane '{0}' lost the job result")]
    ResultLost(&'static str),
}

/// Errors that can occur while taking in or delivering payloads
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A stored payload could not be read back
    #[error("Payload not found: {0}")]
    PayloadMissing(String),

    /// Configuration failed validation; every problem is listed
    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("Metrics error: {0}")]
    Metrics(String),
}
