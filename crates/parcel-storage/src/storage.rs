//! Storage service
//!
//! Abstracts over two directories: a durable *files* directory that every
//! write targets, and an evictable *cache* directory that is only read as a
//! fallback (files written there by older versions remain reachable).
//!
//! Directory faults never propagate. An unusable directory yields `None` or
//! empty listings.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parcel_core::config::StorageConfig;
use parcel_core::ports::{InternalErrorHandler, InternalErrorType};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fsync::TEMP_PREFIX;
use crate::metrics::MetricsRegistry;

/// A file found by [`StorageService::list_files`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Filesystem abstraction over the durable and cache directories
#[derive(Debug, Clone)]
pub struct StorageService {
    files_dir: PathBuf,
    cache_dir: PathBuf,
}

impl StorageService {
    pub fn new(files_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            files_dir: files_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.files_dir, &config.cache_dir)
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path to write `name` to, always inside the files directory
    ///
    /// Parent directories are created. Returns `None` if that fails or the
    /// files directory path is not a directory.
    pub fn get_file_for_write(&self, name: &str) -> Option<PathBuf> {
        let path = self.files_dir.join(name);
        let parent = path.parent()?;
        if let Err(e) = fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), error = %e, "Storage directory unusable");
            return None;
        }
        Some(path)
    }

    /// Existing file named `name`, from the files directory if present,
    /// otherwise from the cache directory
    pub fn get_file_for_read(&self, name: &str) -> Option<PathBuf> {
        [&self.files_dir, &self.cache_dir]
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Every existing copy of `name` across both directories
    pub fn get_all_files(&self, name: &str) -> Vec<PathBuf> {
        [&self.files_dir, &self.cache_dir]
            .into_iter()
            .map(|dir| dir.join(name))
            .filter(|path| path.is_file())
            .collect()
    }

    /// Regular files directly inside `location` in both directories whose
    /// name passes `filter`
    ///
    /// A name present in both directories is reported once, from the files
    /// directory. Temporary files from in-progress writes are skipped.
    pub fn list_files(&self, location: &str, filter: impl Fn(&str) -> bool) -> Vec<StoredFile> {
        let mut files: Vec<StoredFile> = Vec::new();
        for dir in [&self.files_dir, &self.cache_dir] {
            for file in list_dir(&dir.join(location)) {
                if file.name.starts_with(TEMP_PREFIX) || !filter(&file.name) {
                    continue;
                }
                if !files.iter().any(|f| f.name == file.name) {
                    files.push(file);
                }
            }
        }
        files
    }

    /// Total bytes of regular files under `location` in both directories
    pub fn location_used(&self, location: &str) -> u64 {
        dir_size(&self.files_dir.join(location)) + dir_size(&self.cache_dir.join(location))
    }

    /// Total bytes used under the files and cache directories
    pub fn get_storage_used(&self) -> (u64, u64) {
        (dir_size(&self.files_dir), dir_size(&self.cache_dir))
    }

    /// Bytes available to unprivileged users on the files directory's filesystem
    pub fn get_storage_available(&self) -> Option<u64> {
        available_bytes(&self.files_dir)
    }

    /// Publishes current usage to `metrics`
    pub fn report_storage_telemetry(&self, metrics: &MetricsRegistry) {
        let (files, cache) = self.get_storage_used();
        metrics.set_storage_used("files", files);
        metrics.set_storage_used("cache", cache);
        if let Some(available) = self.get_storage_available() {
            metrics.set_storage_available(available);
        }
        debug!(files_bytes = files, cache_bytes = cache, "Storage telemetry reported");
    }

    /// Reports storage telemetry every `interval` until `cancel` fires
    pub fn spawn_storage_telemetry(
        self: Arc<Self>,
        metrics: Arc<MetricsRegistry>,
        interval: Duration,
        error_handler: Arc<dyn InternalErrorHandler>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Storage telemetry started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let storage = self.clone();
                        let metrics = metrics.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            storage.report_storage_telemetry(&metrics)
                        })
                        .await;
                        if let Err(e) = result {
                            error_handler.track_internal_error(
                                InternalErrorType::StorageTelemetryFail,
                                &anyhow::Error::new(e),
                            );
                        }
                    }
                }
            }
            info!("Storage telemetry stopped");
        })
    }
}

fn list_dir(dir: &Path) -> Vec<StoredFile> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            Some(StoredFile {
                name: entry.file_name().to_str()?.to_string(),
                path: entry.path(),
                size_bytes: metadata.len(),
            })
        })
        .collect()
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if metadata.is_dir() {
                Some(dir_size(&entry.path()))
            } else {
                Some(metadata.len())
            }
        })
        .sum()
}

#[cfg(unix)]
fn available_bytes(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn available_bytes(_path: &Path) -> Option<u64> {
    None
}
