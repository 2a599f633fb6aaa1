//! Parcel Storage - Durable payload storage
//!
//! - [`storage::StorageService`] - durable files directory with a cache
//!   directory read fallback, storage usage telemetry
//! - [`payload_store::FilePayloadStorageService`] - the `IPayloadStore`
//!   implementation: gzip on write, atomic replace, priority eviction and a
//!   `dropped/` quarantine for undeliverable payloads
//! - [`compression`] - gzip magic-number detection for both directions
//! - [`metrics::MetricsRegistry`] - Prometheus gauges and counters

pub mod compression;
pub mod fsync;
pub mod metrics;
pub mod payload_store;
pub mod storage;

pub use metrics::MetricsRegistry;
pub use payload_store::{FilePayloadStorageService, StorageLocation};
pub use storage::StorageService;
