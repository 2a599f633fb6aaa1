//! Stored telemetry metadata
//!
//! A [`StoredTelemetryMetadata`] identifies exactly one persisted payload. Its
//! [`filename`](StoredTelemetryMetadata::filename) is the on-disk key and can
//! be parsed back into the same metadata:
//!
//! ```text
//! {timestamp}_{envelopeType}_{uuid}_{processId}_{complete}_v1.json
//! ```
//!
//! Because `_` delimits the parts, `uuid` and `processId` are validated at
//! construction to be non-empty and free of underscores.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::sync::OnceLock;

use chrono::Utc;
use uuid::Uuid;

use super::envelope_type::EnvelopeType;
use super::errors::DomainError;

/// Number of `_`-delimited parts in a payload filename
const FILENAME_PARTS: usize = 6;

/// Version suffix written by this implementation
const FORMAT_VERSION_SUFFIX: &str = "v1.json";

/// Returns the identifier of the current process instance
///
/// Generated once per process. Payloads whose `process_id` differs were
/// written by an earlier process and are candidates for resurrection.
pub fn current_process_identifier() -> &'static str {
    static PROCESS_ID: OnceLock<String> = OnceLock::new();
    PROCESS_ID.get_or_init(|| Uuid::new_v4().simple().to_string())
}

/// Metadata identifying one persisted payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoredTelemetryMetadata {
    timestamp: i64,
    uuid: String,
    process_id: String,
    envelope_type: EnvelopeType,
    complete: bool,
}

impl StoredTelemetryMetadata {
    /// Creates metadata from explicit field values
    ///
    /// # Errors
    /// Returns [`DomainError::ValidationFailed`] if `uuid` or `process_id` is
    /// empty or contains the `_` delimiter.
    pub fn new(
        timestamp: i64,
        uuid: impl Into<String>,
        process_id: impl Into<String>,
        envelope_type: EnvelopeType,
        complete: bool,
    ) -> Result<Self, DomainError> {
        let uuid = uuid.into();
        let process_id = process_id.into();
        validate_part("uuid", &uuid)?;
        validate_part("process_id", &process_id)?;

        Ok(Self {
            timestamp,
            uuid,
            process_id,
            envelope_type,
            complete,
        })
    }

    /// Creates metadata for a payload produced now by the current process
    #[must_use]
    pub fn for_current_process(envelope_type: EnvelopeType, complete: bool) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            uuid: Uuid::new_v4().to_string(),
            process_id: current_process_identifier().to_string(),
            envelope_type,
            complete,
        }
    }

    /// Creation time in milliseconds since the Unix epoch
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn envelope_type(&self) -> EnvelopeType {
        self.envelope_type
    }

    /// Whether the payload is final (`true`) or an in-progress snapshot
    pub fn complete(&self) -> bool {
        self.complete
    }

    /// Returns a copy with the `complete` flag replaced
    #[must_use]
    pub fn with_complete(&self, complete: bool) -> Self {
        Self {
            complete,
            ..self.clone()
        }
    }

    /// Priority key used by the delivery queue and the priority lane
    pub fn priority(&self) -> TelemetryPriority {
        TelemetryPriority {
            rank: self.envelope_type.priority(),
            timestamp: self.timestamp,
        }
    }

    /// Deterministic on-disk filename encoding every field
    pub fn filename(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}",
            self.timestamp,
            self.envelope_type.description(),
            self.uuid,
            self.process_id,
            self.complete,
            FORMAT_VERSION_SUFFIX
        )
    }

    /// Parses a filename produced by [`filename`](Self::filename)
    ///
    /// Any `v<N>.json` suffix is accepted so older format versions can still
    /// be listed.
    ///
    /// # Errors
    /// Returns a [`DomainError`] naming the first part that fails to decode.
    pub fn from_filename(filename: &str) -> Result<Self, DomainError> {
        let parts: Vec<&str> = filename.split('_').collect();
        if parts.len() != FILENAME_PARTS {
            return Err(DomainError::InvalidPartCount {
                filename: filename.to_string(),
                expected: FILENAME_PARTS,
                found: parts.len(),
            });
        }

        let invalid = |field: &'static str, value: &str| DomainError::InvalidField {
            filename: filename.to_string(),
            field,
            value: value.to_string(),
        };

        let timestamp = parts[0]
            .parse::<i64>()
            .map_err(|_| invalid("timestamp", parts[0]))?;
        let envelope_type = parts[1]
            .parse::<EnvelopeType>()
            .map_err(|_| invalid("envelope type", parts[1]))?;
        let complete = parts[4]
            .parse::<bool>()
            .map_err(|_| invalid("complete flag", parts[4]))?;

        let version = parts[5];
        let is_versioned = version
            .strip_prefix('v')
            .and_then(|rest| rest.strip_suffix(".json"))
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if !is_versioned {
            return Err(invalid("format version", version));
        }

        Self::new(timestamp, parts[2], parts[3], envelope_type, complete)
            .map_err(|_| invalid("identifier", filename))
    }
}

impl Display for StoredTelemetryMetadata {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename())
    }
}

impl PartialOrd for StoredTelemetryMetadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StoredTelemetryMetadata {
    fn cmp(&self, other: &Self) -> Ordering {
        stored_telemetry_cmp(self, other)
            .then_with(|| self.uuid.cmp(&other.uuid))
            .then_with(|| self.process_id.cmp(&other.process_id))
            .then_with(|| self.complete.cmp(&other.complete))
    }
}

/// Delivery priority comparator
///
/// Envelope type priority first (crash, session, log, network), then creation
/// timestamp ascending so that older payloads of the same type sort first.
pub fn stored_telemetry_cmp(a: &StoredTelemetryMetadata, b: &StoredTelemetryMetadata) -> Ordering {
    a.priority().cmp(&b.priority())
}

/// Priority key of a stored payload: type rank, then timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TelemetryPriority {
    pub rank: u8,
    pub timestamp: i64,
}

fn validate_part(field: &str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::ValidationFailed(format!("{field} must not be empty")));
    }
    if value.contains('_') {
        return Err(DomainError::ValidationFailed(format!(
            "{field} must not contain '_': {value}"
        )));
    }
    Ok(())
}
