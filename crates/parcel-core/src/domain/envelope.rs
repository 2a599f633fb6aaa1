//! Generic envelope wrapper and log payload bodies
//!
//! An [`Envelope`] is what producers hand to the intake service: resource and
//! metadata sections describing the app and user, a format version, a payload
//! type string and a typed `data` body. Unknown JSON fields in the resource and
//! metadata sections are kept in `extra` so a round trip through storage never
//! loses data written by a newer producer.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::session::Attribute;

/// Top-level serializable wrapper around a telemetry payload
///
/// Envelopes are treated as immutable; transformations such as
/// [`with_data`](Envelope::with_data) consume the envelope and return a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<EnvelopeResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
    pub data: T,
}

impl<T> Envelope<T> {
    /// Creates an envelope with only a data body
    pub fn new(data: T) -> Self {
        Self {
            resource: None,
            metadata: None,
            version: None,
            payload_type: None,
            data,
        }
    }

    /// Sets the resource section
    #[must_use]
    pub fn with_resource(mut self, resource: EnvelopeResource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Sets the metadata section
    #[must_use]
    pub fn with_metadata(mut self, metadata: EnvelopeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the payload type string (`"spans"`, `"logs"`)
    #[must_use]
    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    /// Returns a new envelope with the same sections and a different body
    pub fn with_data<U>(self, data: U) -> Envelope<U> {
        Envelope {
            resource: self.resource,
            metadata: self.metadata,
            version: self.version,
            payload_type: self.payload_type,
            data,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Deserializes an envelope from a JSON reader
    pub fn from_json_reader<R: std::io::Read>(reader: R) -> serde_json::Result<Self> {
        serde_json::from_reader(reader)
    }
}

/// Information about the app and device that produced the payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Fields not modelled above, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Information about the user and locale at capture time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personas: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One log record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_unix_nano: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<Attribute>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

/// Body of log, crash and network envelopes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<Log>>,
}
