//! Domain error types
//!
//! Errors raised while validating or decoding domain values. Filename parse
//! failures are returned as values so directory scans can skip foreign files.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Filename does not have the expected number of `_`-delimited parts
    #[error("Invalid payload filename '{filename}': expected {expected} parts, found {found}")]
    InvalidPartCount {
        /// The offending filename
        filename: String,
        /// Number of parts required by the current format
        expected: usize,
        /// Number of parts actually found
        found: usize,
    },

    /// A filename part could not be decoded into its field type
    #[error("Invalid payload filename '{filename}': bad {field} '{value}'")]
    InvalidField {
        /// The offending filename
        filename: String,
        /// Name of the field being decoded
        field: &'static str,
        /// Raw text of the part
        value: String,
    },

    /// Unknown envelope type description
    #[error("Unknown envelope type: {0}")]
    UnknownEnvelopeType(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// A session envelope does not contain exactly one session span
    #[error("Session payload contains {0} session spans, expected exactly one")]
    SessionSpanCount(usize),
}
