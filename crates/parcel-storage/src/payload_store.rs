//! File-backed payload storage
//!
//! [`FilePayloadStorageService`] implements [`IPayloadStore`] over one
//! location (`payloads` or `snapshots`) of a [`StorageService`]:
//!
//! - files are named by [`StoredTelemetryMetadata::filename`] and gzip
//!   compressed unless the writer already produced gzip
//! - every write replaces its target atomically
//! - after a write, the lowest-priority payloads are evicted until the
//!   location fits its byte budget; dropped payloads go first
//! - undeliverable payloads are quarantined under `dropped/`

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::sync::{Arc, Mutex, MutexGuard};

use parcel_core::config::DEFAULT_MAX_PAYLOAD_STORAGE_BYTES;
use parcel_core::domain::metadata::current_process_identifier;
use parcel_core::domain::trace::trace;
use parcel_core::domain::{DeliveryTraceState, DeliveryTracer, StoredTelemetryMetadata};
use parcel_core::ports::{
    DeleteCallback, IPayloadStore, InternalErrorHandler, InternalErrorType, PayloadReader,
    StorageError, WriterAction,
};
use tracing::{debug, info, warn};

use crate::compression::{decompressing_reader, GzipIfNeededWriter};
use crate::fsync::{fsync_dir, write_atomically};
use crate::metrics::MetricsRegistry;
use crate::storage::{StorageService, StoredFile};

/// Subdirectory of a location holding undeliverable payloads
pub const DROPPED_DIR: &str = "dropped";

/// Which payload store a service instance manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageLocation {
    /// Complete payloads awaiting delivery
    Payloads,
    /// Incomplete payloads: periodic session snapshots and cached crash envelopes
    Snapshots,
}

impl StorageLocation {
    pub fn dir_name(self) -> &'static str {
        match self {
            StorageLocation::Payloads => "payloads",
            StorageLocation::Snapshots => "snapshots",
        }
    }
}

/// A stored payload together with its file
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub metadata: StoredTelemetryMetadata,
    pub file: StoredFile,
}

/// [`IPayloadStore`] implementation writing gzip files to disk
pub struct FilePayloadStorageService {
    storage: Arc<StorageService>,
    location: StorageLocation,
    max_bytes: u64,
    retain_dropped: bool,
    process_id: String,
    error_handler: Arc<dyn InternalErrorHandler>,
    metrics: Option<Arc<MetricsRegistry>>,
    tracer: Option<Arc<DeliveryTracer>>,
    // Serializes mutations so eviction sees a consistent directory.
    write_lock: Mutex<()>,
}

impl FilePayloadStorageService {
    pub fn new(
        storage: Arc<StorageService>,
        location: StorageLocation,
        error_handler: Arc<dyn InternalErrorHandler>,
    ) -> Self {
        Self {
            storage,
            location,
            max_bytes: DEFAULT_MAX_PAYLOAD_STORAGE_BYTES,
            retain_dropped: true,
            process_id: current_process_identifier().to_string(),
            error_handler,
            metrics: None,
            tracer: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Byte budget for this location, dropped payloads included
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    #[must_use]
    pub fn with_retain_dropped(mut self, retain: bool) -> Self {
        self.retain_dropped = retain;
        self
    }

    /// Identifier of the running process; payloads from other processes are
    /// reported as undelivered
    #[must_use]
    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = process_id.into();
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<DeliveryTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn location(&self) -> StorageLocation {
        self.location
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes used by this location, dropped payloads included
    pub fn storage_used(&self) -> u64 {
        self.storage.location_used(self.location.dir_name())
    }

    /// Deliverable payloads with their files, highest priority first
    pub fn list_payloads(&self) -> Vec<StoredPayload> {
        self.list(self.location.dir_name())
    }

    /// Dropped payloads with their files, highest priority first
    pub fn list_dropped(&self) -> Vec<StoredPayload> {
        self.list(&self.dropped_dir())
    }

    /// Deletes every deliverable payload, returning how many were removed
    pub fn delete_all(&self) -> usize {
        let _guard = self.lock();
        self.list_payloads()
            .iter()
            .filter(|p| self.remove_copies(&self.relative(&p.metadata)).is_ok())
            .count()
    }

    /// Deletes every dropped payload, returning how many were removed
    pub fn delete_all_dropped(&self) -> usize {
        let _guard = self.lock();
        self.list_dropped()
            .iter()
            .filter(|p| self.remove_copies(&self.dropped_relative(&p.metadata)).is_ok())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn dropped_dir(&self) -> String {
        format!("{}/{DROPPED_DIR}", self.location.dir_name())
    }

    fn relative(&self, metadata: &StoredTelemetryMetadata) -> String {
        format!("{}/{}", self.location.dir_name(), metadata.filename())
    }

    fn dropped_relative(&self, metadata: &StoredTelemetryMetadata) -> String {
        format!("{}/{}", self.dropped_dir(), metadata.filename())
    }

    fn list(&self, dir: &str) -> Vec<StoredPayload> {
        let mut payloads: Vec<StoredPayload> = self
            .storage
            .list_files(dir, |_| true)
            .into_iter()
            .filter_map(|file| match StoredTelemetryMetadata::from_filename(&file.name) {
                Ok(metadata) => Some(StoredPayload { metadata, file }),
                Err(e) => {
                    debug!(file = %file.name, error = %e, "Skipping unrecognized file");
                    None
                }
            })
            .collect();
        payloads.sort_by(|a, b| a.metadata.cmp(&b.metadata));
        payloads
    }

    /// Removes every copy of `relative` from both directories, returning the
    /// bytes freed
    fn remove_copies(&self, relative: &str) -> io::Result<u64> {
        let mut freed = 0;
        for path in self.storage.get_all_files(relative) {
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => freed += size,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(freed)
    }

    fn record(&self, state: DeliveryTraceState) {
        trace(self.tracer.as_deref(), state);
    }

    fn prune_if_over_limit(&self) {
        let mut used = self.storage_used();
        if used <= self.max_bytes {
            return;
        }

        let mut dropped = self.list_dropped();
        dropped.sort_by(|a, b| eviction_cmp(&a.metadata, &b.metadata));
        let mut active = self.list_payloads();
        active.sort_by(|a, b| eviction_cmp(&a.metadata, &b.metadata));

        let candidates = dropped
            .into_iter()
            .map(|p| (self.dropped_relative(&p.metadata), p))
            .chain(active.into_iter().map(|p| (self.relative(&p.metadata), p)));

        for (relative, payload) in candidates {
            if used <= self.max_bytes {
                break;
            }
            match self.remove_copies(&relative) {
                Ok(freed) => {
                    used = used.saturating_sub(freed);
                    let filename = payload.metadata.filename();
                    info!(
                        filename = %filename,
                        freed_bytes = freed,
                        used_bytes = used,
                        max_bytes = self.max_bytes,
                        "Evicted payload under storage pressure"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_evicted(payload.metadata.envelope_type().description());
                    }
                    self.record(DeliveryTraceState::PayloadEvicted { filename });
                }
                Err(e) => {
                    self.error_handler.track_internal_error(
                        InternalErrorType::PayloadEvictionFail,
                        &anyhow::Error::new(e).context(format!("evicting {relative}")),
                    );
                }
            }
        }
    }

    fn move_to_dropped(&self, metadata: &StoredTelemetryMetadata) -> io::Result<bool> {
        let relative = self.relative(metadata);
        let Some(source) = self.storage.get_file_for_read(&relative) else {
            return Ok(false);
        };
        let target = self
            .storage
            .get_file_for_write(&self.dropped_relative(metadata))
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "dropped directory unusable"))?;

        if fs::rename(&source, &target).is_err() {
            // Source may live on another filesystem (cache directory).
            fs::copy(&source, &target)?;
        }
        self.remove_copies(&relative)?;
        if let Some(parent) = target.parent() {
            fsync_dir(parent)?;
        }
        Ok(true)
    }
}

impl IPayloadStore for FilePayloadStorageService {
    fn store(&self, metadata: &StoredTelemetryMetadata, action: WriterAction<'_>) -> Result<(), StorageError> {
        let _guard = self.lock();
        let filename = metadata.filename();
        let relative = self.relative(metadata);
        let path = self.storage.get_file_for_write(&relative).ok_or_else(|| {
            StorageError::Unavailable(self.storage.files_dir().join(self.location.dir_name()))
        })?;

        let mut writer_failed = false;
        let written = write_atomically(&path, |file| {
            let mut writer = GzipIfNeededWriter::new(BufWriter::new(file));
            if let Err(e) = action(&mut writer) {
                writer_failed = true;
                return Err(e);
            }
            writer.finish()?.into_inner().map_err(io::IntoInnerError::into_error)
        });

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(source) => {
                let err = if writer_failed {
                    StorageError::Writer { filename, source }
                } else {
                    StorageError::Io { path, source }
                };
                warn!(error = %err, "Failed to store payload");
                self.record(DeliveryTraceState::PayloadStoreFailed {
                    filename: metadata.filename(),
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        debug!(
            filename = %filename,
            location = self.location.dir_name(),
            bytes,
            "Payload stored"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_stored(metadata.envelope_type().description());
        }
        self.record(DeliveryTraceState::PayloadStored { filename, bytes });

        self.prune_if_over_limit();
        Ok(())
    }

    fn load_payload_as_stream(&self, metadata: &StoredTelemetryMetadata) -> Option<PayloadReader> {
        let relative = self.relative(metadata);
        let result = self
            .storage
            .get_file_for_read(&relative)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "payload file not found"))
            .and_then(File::open)
            .and_then(|file| decompressing_reader(BufReader::new(file)));

        match result {
            Ok(reader) => Some(reader),
            Err(e) => {
                self.error_handler.track_internal_error(
                    InternalErrorType::PayloadLoadFail,
                    &anyhow::Error::new(e).context(format!("loading {relative}")),
                );
                None
            }
        }
    }

    fn delete(&self, metadata: &StoredTelemetryMetadata, on_complete: Option<DeleteCallback>) {
        {
            let _guard = self.lock();
            for relative in [self.relative(metadata), self.dropped_relative(metadata)] {
                match self.remove_copies(&relative) {
                    Ok(0) => {}
                    Ok(_) => {
                        debug!(file = %relative, "Payload deleted");
                        self.record(DeliveryTraceState::PayloadDeleted {
                            filename: metadata.filename(),
                        });
                    }
                    Err(e) => self.error_handler.track_internal_error(
                        InternalErrorType::PayloadDeleteFail,
                        &anyhow::Error::new(e).context(format!("deleting {relative}")),
                    ),
                }
            }
        }
        if let Some(callback) = on_complete {
            callback();
        }
    }

    fn get_payloads_by_priority(&self) -> Vec<StoredTelemetryMetadata> {
        self.list_payloads().into_iter().map(|p| p.metadata).collect()
    }

    fn get_undelivered_payloads(&self) -> Vec<StoredTelemetryMetadata> {
        self.list_payloads()
            .into_iter()
            .map(|p| p.metadata)
            .filter(|m| m.process_id() != self.process_id)
            .collect()
    }

    fn mark_undeliverable(&self, metadata: &StoredTelemetryMetadata) {
        let _guard = self.lock();
        let filename = metadata.filename();

        if !self.retain_dropped {
            if let Err(e) = self.remove_copies(&self.relative(metadata)) {
                self.error_handler.track_internal_error(
                    InternalErrorType::PayloadDropFail,
                    &anyhow::Error::new(e).context(format!("deleting undeliverable {filename}")),
                );
            }
            return;
        }

        match self.move_to_dropped(metadata) {
            Ok(true) => info!(filename = %filename, "Payload moved to dropped"),
            Ok(false) => debug!(filename = %filename, "Undeliverable payload already gone"),
            Err(e) => self.error_handler.track_internal_error(
                InternalErrorType::PayloadDropFail,
                &anyhow::Error::new(e).context(format!("quarantining {filename}")),
            ),
        }
    }

    fn get_dropped_payloads(&self) -> Vec<StoredTelemetryMetadata> {
        self.list_dropped().into_iter().map(|p| p.metadata).collect()
    }
}

/// Eviction order: lowest type priority first, then oldest first
fn eviction_cmp(a: &StoredTelemetryMetadata, b: &StoredTelemetryMetadata) -> Ordering {
    b.envelope_type()
        .priority()
        .cmp(&a.envelope_type().priority())
        .then_with(|| a.timestamp().cmp(&b.timestamp()))
}
