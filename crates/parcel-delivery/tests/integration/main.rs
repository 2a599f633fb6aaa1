//! Integration tests for parcel-delivery
//!
//! Uses wiremock to simulate the telemetry backend and verifies the HTTP
//! execution service and the full intake, resurrection and delivery pipeline.

mod common;

mod test_execution;
mod test_pipeline;
