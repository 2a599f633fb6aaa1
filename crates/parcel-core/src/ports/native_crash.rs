//! Native crash source port
//!
//! Implemented by the embedding application's native crash handler.

use std::collections::BTreeMap;

use crate::domain::{NativeCrashData, NativeCrashEnvelope};

pub trait INativeCrashService: Send + Sync {
    /// Native crashes recorded by previous process instances
    fn get_native_crashes(&self) -> Vec<NativeCrashData>;

    /// Emits a crash as telemetry, tagged with the properties of the session
    /// it happened in (empty for sessionless crashes) and extra metadata
    ///
    /// `envelope` holds the resource and metadata sections for the crash
    /// envelope. It is `None` for a sessionless crash when no cached crash
    /// envelope survived.
    fn send_native_crash(
        &self,
        crash: &NativeCrashData,
        envelope: Option<&NativeCrashEnvelope>,
        session_properties: &BTreeMap<String, String>,
        metadata: &BTreeMap<String, String>,
    );

    fn delete_all_native_crashes(&self);
}
