//! Envelope types, delivery priority and backend endpoints

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Kind of telemetry carried by a stored payload
///
/// The declaration order is the delivery priority: payloads that are most
/// critical to deliver come first, and the lowest priority is evicted first
/// under storage pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Crash,
    Session,
    Log,
    Network,
}

impl EnvelopeType {
    /// All envelope types in priority order
    pub const ALL: [EnvelopeType; 4] = [
        EnvelopeType::Crash,
        EnvelopeType::Session,
        EnvelopeType::Log,
        EnvelopeType::Network,
    ];

    /// Stable description used in filenames and request headers
    pub fn description(self) -> &'static str {
        match self {
            EnvelopeType::Crash => "crash",
            EnvelopeType::Session => "session",
            EnvelopeType::Log => "log",
            EnvelopeType::Network => "network",
        }
    }

    /// Priority rank; lower ranks are delivered first and evicted last
    pub fn priority(self) -> u8 {
        match self {
            EnvelopeType::Crash => 0,
            EnvelopeType::Session => 1,
            EnvelopeType::Log => 2,
            EnvelopeType::Network => 3,
        }
    }

    /// Backend endpoint that accepts this envelope type
    pub fn endpoint(self) -> Endpoint {
        match self {
            EnvelopeType::Session => Endpoint::Spans,
            EnvelopeType::Crash | EnvelopeType::Log | EnvelopeType::Network => Endpoint::Logs,
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl FromStr for EnvelopeType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvelopeType::ALL
            .into_iter()
            .find(|t| t.description() == s)
            .ok_or_else(|| DomainError::UnknownEnvelopeType(s.to_string()))
    }
}

/// Backend endpoint a payload is POSTed to
///
/// A `429 Too Many Requests` blocks the whole endpoint, not one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Logs,
    Spans,
}

impl Endpoint {
    /// Path relative to the configured base URL
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Logs => "/v2/logs",
            Endpoint::Spans => "/v2/spans",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_round_trips_through_from_str() {
        for ty in EnvelopeType::ALL {
            assert_eq!(ty.description().parse::<EnvelopeType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_unknown_description_is_rejected() {
        let err = "blob".parse::<EnvelopeType>().unwrap_err();
        assert_eq!(err, DomainError::UnknownEnvelopeType("blob".to_string()));
    }

    #[test]
    fn test_priority_matches_declaration_order() {
        let mut types = vec![
            EnvelopeType::Network,
            EnvelopeType::Log,
            EnvelopeType::Crash,
            EnvelopeType::Session,
        ];
        types.sort();
        assert_eq!(types, EnvelopeType::ALL.to_vec());

        for pair in EnvelopeType::ALL.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
        }
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(EnvelopeType::Session.endpoint(), Endpoint::Spans);
        assert_eq!(EnvelopeType::Crash.endpoint(), Endpoint::Logs);
        assert_eq!(EnvelopeType::Network.endpoint().path(), "/v2/logs");
    }
}
