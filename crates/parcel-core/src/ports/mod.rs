//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the delivery pipeline depends on, whose
//! implementations live in the storage and delivery crates or are supplied
//! by the embedding application.
//!
//! ## Ports Overview
//!
//! - [`IPayloadStore`] - Durable payload blobs keyed by stored metadata
//! - [`IRequestExecutionService`] - Sends one payload to the backend
//! - [`INativeCrashService`] - Native crashes left by a previous process
//! - [`ISchedulingService`] - Notified when new payloads become deliverable
//! - [`InternalErrorHandler`] - Sink for internal diagnostics

pub mod diagnostics;
pub mod native_crash;
pub mod payload_store;
pub mod request_execution;
pub mod scheduling;

pub use diagnostics::{
    InternalErrorHandler, InternalErrorType, RecordingErrorHandler, TracingErrorHandler,
};
pub use native_crash::INativeCrashService;
pub use payload_store::{DeleteCallback, IPayloadStore, PayloadReader, StorageError, WriterAction};
pub use request_execution::{ExecutionResult, IRequestExecutionService};
pub use scheduling::ISchedulingService;
