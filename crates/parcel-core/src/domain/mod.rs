//! Domain entities
//!
//! This module contains the core domain types for parcel:
//! - Envelope types, their delivery priority and endpoints
//! - Stored telemetry metadata and its on-disk filename codec
//! - Generic envelopes and the session/log payload bodies
//! - Native crash records from a previous process
//! - Delivery trace states for the diagnostic trace log
//! - Domain-specific error types

pub mod envelope;
pub mod envelope_type;
pub mod errors;
pub mod metadata;
pub mod native_crash;
pub mod session;
pub mod trace;

pub use envelope::{Envelope, EnvelopeMetadata, EnvelopeResource, Log, LogPayload};
pub use envelope_type::{Endpoint, EnvelopeType};
pub use errors::DomainError;
pub use metadata::{stored_telemetry_cmp, StoredTelemetryMetadata, TelemetryPriority};
pub use native_crash::{NativeCrashData, NativeCrashEnvelope};
pub use session::{find_attribute, Attribute, SessionPayload, Span, SpanEvent, SpanStatus};
pub use trace::{trace, DeliveryTraceState, DeliveryTracer, TraceEntry};
