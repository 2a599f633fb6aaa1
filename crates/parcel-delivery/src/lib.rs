//! Parcel Delivery - Payload intake, scheduling and recovery
//!
//! Provides:
//! - Worker lanes: a single-concurrency priority lane and a bounded background lane
//! - Intake of finished and in-progress envelopes
//! - A restartable delivery loop with backoff, 429 handling and drop policy
//! - HTTP delivery to the telemetry backend
//! - Periodic session snapshots and resurrection of payloads left by a dead process
//!
//! ## Modules
//!
//! - [`worker`] - Priority and background worker lanes
//! - [`intake`] - Entry point for producers
//! - [`scheduling`] - Delivery loop
//! - [`execution`] - HTTP request execution service
//! - [`caching`] - Periodic session snapshot caching
//! - [`resurrection`] - Recovery of payloads from previous processes
//! - [`module`] - Wiring of all services from a [`Config`](parcel_core::config::Config)

pub mod caching;
pub mod error;
pub mod execution;
pub mod intake;
pub mod module;
pub mod resurrection;
pub mod retry;
pub mod scheduling;
pub mod worker;

pub use caching::{PayloadCachingService, SessionSnapshotProvider};
pub use error::{DeliveryError, WorkerError};
pub use execution::HttpRequestExecutionService;
pub use intake::IntakeService;
pub use module::DeliveryModule;
pub use resurrection::{PayloadResurrectionService, ResurrectionReport};
pub use retry::RetryPolicy;
pub use scheduling::{FlushReport, SchedulingService};
pub use worker::{BackgroundWorker, PriorityWorker};
