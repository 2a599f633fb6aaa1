//! Native crash records left behind by a previous process

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::envelope::{Envelope, EnvelopeMetadata, EnvelopeResource};

/// A native (NDK) crash captured by a previous process instance
///
/// Matched to a resurrected session by `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeCrashData {
    pub native_crash_id: String,
    pub session_id: String,
    /// Crash time in milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<BTreeMap<String, String>>,
}

impl NativeCrashData {
    pub fn new(native_crash_id: impl Into<String>, session_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            native_crash_id: native_crash_id.into(),
            session_id: session_id.into(),
            timestamp,
            crash: None,
            symbols: None,
        }
    }
}

/// Envelope sections a native crash is sent with
///
/// Taken from the dead session the crash belongs to, or from the cached crash
/// envelope for a crash that matches no session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeCrashEnvelope {
    pub resource: EnvelopeResource,
    pub metadata: EnvelopeMetadata,
}

impl NativeCrashEnvelope {
    /// Copies the sections of `envelope`, defaulting the ones it lacks
    pub fn from_envelope<T>(envelope: &Envelope<T>) -> Self {
        Self {
            resource: envelope.resource.clone().unwrap_or_default(),
            metadata: envelope.metadata.clone().unwrap_or_default(),
        }
    }

    /// Copies the sections of `envelope` only when it carries both
    pub fn from_complete_envelope<T>(envelope: &Envelope<T>) -> Option<Self> {
        Some(Self {
            resource: envelope.resource.clone()?,
            metadata: envelope.metadata.clone()?,
        })
    }
}
