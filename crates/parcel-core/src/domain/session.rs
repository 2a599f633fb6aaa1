//! Session payloads, spans and attributes
//!
//! A session envelope carries completed spans plus snapshots of spans that
//! were still open when the payload was written. Exactly one span per session
//! payload is the *session span*, identified by the `emb.type = ux.session`
//! attribute.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::envelope::Envelope;

/// Attribute key carrying the embrace span type
pub const EMB_TYPE_KEY: &str = "emb.type";
/// Value of [`EMB_TYPE_KEY`] that marks the session span
pub const SESSION_SPAN_TYPE: &str = "ux.session";
pub const SESSION_ID_KEY: &str = "session.id";
pub const CRASH_ID_KEY: &str = "emb.crash_id";
pub const HEARTBEAT_TIME_KEY: &str = "emb.heartbeat_time_unix_nano";
pub const ERROR_CODE_KEY: &str = "emb.error_code";
pub const APP_STATE_KEY: &str = "emb.state";
pub const PROCESS_IDENTIFIER_KEY: &str = "emb.process_identifier";
/// Prefix of attributes holding user-set session properties
pub const SESSION_PROPERTY_PREFIX: &str = "emb.properties.";

/// Error code written on spans that never ended because the process died
pub const FAILURE_ERROR_CODE: &str = "failure";

/// Key/value attribute as serialized on spans and logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Attribute {
    pub fn new(key: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            data: Some(data.into()),
        }
    }
}

/// Looks up the value of `key` in an attribute list
pub fn find_attribute<'a>(attributes: &'a [Attribute], key: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.key == key)
        .and_then(|a| a.data.as_deref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_unix_nano: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<Attribute>>,
}

/// A completed span or the snapshot of an open one
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_nanos: Option<i64>,
    /// Absent on snapshots of spans that have not ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_nanos: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SpanStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<SpanEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<Attribute>>,
}

impl Span {
    /// Value of the attribute `key`, if present
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .as_deref()
            .and_then(|attrs| find_attribute(attrs, key))
    }

    pub fn is_session_span(&self) -> bool {
        self.attribute(EMB_TYPE_KEY) == Some(SESSION_SPAN_TYPE)
    }

    /// Returns a copy with `key = value` appended to the attributes
    #[must_use]
    pub fn with_attribute(&self, key: &str, value: &str) -> Span {
        let mut span = self.clone();
        span.attributes
            .get_or_insert_with(Vec::new)
            .push(Attribute::new(key, value));
        span
    }

    /// Converts an unfinished span snapshot into a failed span ending at
    /// `end_time_ms`
    #[must_use]
    pub fn to_failed_span(&self, end_time_ms: i64) -> Span {
        let mut span = self.with_attribute(ERROR_CODE_KEY, FAILURE_ERROR_CODE);
        span.end_time_nanos = Some(end_time_ms.saturating_mul(1_000_000));
        span.status = Some(SpanStatus::Error);
        span
    }
}

/// Body of a session envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spans: Option<Vec<Span>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_snapshots: Option<Vec<Span>>,
}

impl Envelope<SessionPayload> {
    /// The single session span, looked up among completed spans first and
    /// then among snapshots
    pub fn session_span(&self) -> Option<&Span> {
        fn single(spans: Option<&Vec<Span>>) -> Option<&Span> {
            let mut found = spans?.iter().filter(|s| s.is_session_span());
            match (found.next(), found.next()) {
                (Some(span), None) => Some(span),
                _ => None,
            }
        }
        single(self.data.spans.as_ref()).or_else(|| single(self.data.span_snapshots.as_ref()))
    }

    /// Value of the `session.id` attribute on the session span
    pub fn session_id(&self) -> Option<&str> {
        self.session_span()?.attribute(SESSION_ID_KEY)
    }

    /// User-set session properties with their key prefix stripped
    pub fn session_properties(&self) -> BTreeMap<String, String> {
        let Some(attributes) = self.session_span().and_then(|s| s.attributes.as_ref()) else {
            return BTreeMap::new();
        };
        attributes
            .iter()
            .filter_map(|a| {
                let key = a.key.strip_prefix(SESSION_PROPERTY_PREFIX)?;
                Some((key.to_string(), a.data.clone()?))
            })
            .collect()
    }
}
