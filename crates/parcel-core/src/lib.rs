//! Parcel Core - Domain model, configuration and ports
//!
//! This crate contains the shared core of the parcel delivery engine:
//! - **Domain types** - `StoredTelemetryMetadata`, `EnvelopeType`, `Envelope`,
//!   session payloads and spans, native crash records, delivery trace states
//! - **Port definitions** - Traits implemented by the storage and delivery
//!   crates: `IPayloadStore`, `IRequestExecutionService`, `INativeCrashService`,
//!   `ISchedulingService`, `InternalErrorHandler`
//! - **Configuration** - YAML-backed [`config::Config`] with validation
//! - **Runtime plumbing** - observer lists for connectivity changes and the
//!   config-gated [`data_source::DataSourceState`]
//!
//! # Architecture
//!
//! Producers hand finished envelopes to the intake service, which persists
//! them through an `IPayloadStore` and notifies the scheduler. The domain
//! module has no I/O; ports describe everything that touches disk or network.

pub mod config;
pub mod connectivity;
pub mod data_source;
pub mod domain;
pub mod ports;
