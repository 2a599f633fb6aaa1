//! Payload store port (driven/secondary port)
//!
//! The sole owner of telemetry payload files. Every mutation of the payload
//! directories goes through an implementation of [`IPayloadStore`].
//!
//! ## Design Notes
//!
//! - Methods are synchronous and may block on disk I/O. Callers run them on
//!   a worker lane or inside `spawn_blocking`, never on an async executor
//!   thread directly.
//! - Only `store` returns an error. Every other fault is reported to the
//!   store's internal error handler and degrades to `None`/empty results.

use std::io::{Read, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::domain::StoredTelemetryMetadata;

/// Streams payload bytes into the store. The bytes may already be gzip
/// compressed; the store detects that and does not compress twice.
pub type WriterAction<'a> = Box<dyn FnOnce(&mut dyn Write) -> std::io::Result<()> + Send + 'a>;

/// Decompressed view of a stored payload
pub type PayloadReader = Box<dyn Read + Send>;

/// Invoked once a delete attempt finishes, whether or not a file was removed
pub type DeleteCallback = Box<dyn FnOnce() + Send>;

/// Errors returned by [`IPayloadStore::store`]
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Payload writer failed for {filename}: {source}")]
    Writer {
        filename: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage directory unusable: {0}")]
    Unavailable(PathBuf),
}

/// Durable record of payloads awaiting or eligible for delivery
pub trait IPayloadStore: Send + Sync {
    /// Writes a payload under `metadata.filename()`
    ///
    /// The write is atomic: readers see either the previous file or the
    /// complete new one. Storage limits are enforced afterwards by evicting
    /// the lowest-priority payloads.
    fn store(&self, metadata: &StoredTelemetryMetadata, action: WriterAction<'_>) -> Result<(), StorageError>;

    /// Opens a decompressing reader, or `None` if the payload is missing or unreadable
    fn load_payload_as_stream(&self, metadata: &StoredTelemetryMetadata) -> Option<PayloadReader>;

    /// Deletes a payload. Deleting a missing payload is not an error.
    /// `on_complete` runs in every case.
    fn delete(&self, metadata: &StoredTelemetryMetadata, on_complete: Option<DeleteCallback>);

    /// All deliverable payloads, highest priority first
    fn get_payloads_by_priority(&self) -> Vec<StoredTelemetryMetadata>;

    /// Payloads written by a previous process that never reached delivery
    fn get_undelivered_payloads(&self) -> Vec<StoredTelemetryMetadata>;

    /// Moves a payload out of the delivery queue for good
    fn mark_undeliverable(&self, metadata: &StoredTelemetryMetadata);

    /// Payloads previously passed to [`mark_undeliverable`](Self::mark_undeliverable)
    fn get_dropped_payloads(&self) -> Vec<StoredTelemetryMetadata>;
}
