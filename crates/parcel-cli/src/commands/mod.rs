//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parcel_core::config::Config;
use parcel_core::ports::TracingErrorHandler;
use parcel_storage::{FilePayloadStorageService, StorageLocation, StorageService};

use crate::output::OutputFormat;

pub mod config;
pub mod flush;
pub mod purge;
pub mod status;

/// Settings shared by every command
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub format: OutputFormat,
    pub config_path: PathBuf,
}

impl CommandContext {
    /// Loads the configuration file, falling back to defaults when it does
    /// not exist. A file that exists but does not parse is an error.
    pub fn load_config(&self) -> Result<Config> {
        if !self.config_path.exists() {
            return Ok(Config::default());
        }
        Config::load(&self.config_path)
            .with_context(|| format!("Failed to load configuration from {}", self.config_path.display()))
    }
}

/// The payload and snapshot stores described by `config`
pub struct Stores {
    pub storage: Arc<StorageService>,
    pub payloads: FilePayloadStorageService,
    pub snapshots: FilePayloadStorageService,
}

impl Stores {
    pub fn open(config: &Config) -> Self {
        let storage = Arc::new(StorageService::from_config(&config.storage));
        let open = |location| {
            FilePayloadStorageService::new(storage.clone(), location, Arc::new(TracingErrorHandler))
                .with_max_bytes(config.storage.max_payload_storage_bytes)
                .with_retain_dropped(config.delivery.retain_dropped_payloads)
        };
        let payloads = open(StorageLocation::Payloads);
        let snapshots = open(StorageLocation::Snapshots);
        Self {
            storage,
            payloads,
            snapshots,
        }
    }

    pub fn all(&self) -> [&FilePayloadStorageService; 2] {
        [&self.payloads, &self.snapshots]
    }
}
