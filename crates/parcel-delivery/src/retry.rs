//! Retry policy for failed deliveries
//!
//! Transient failures are retried after `initial_delay * multiplier^n`,
//! capped at `max_delay`, where `n` is the number of earlier failures. After
//! `max_attempts` failures the payload is dropped.

use std::time::Duration;

use parcel_core::config::RetryConfig;
use tracing::warn;

/// Backoff curve and retry ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            multiplier: config.multiplier,
            max_delay: config.max_delay(),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before the next attempt after `failed_attempts` failures
    ///
    /// The first failure (`failed_attempts == 1`) waits `initial_delay`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        if factor == 1.0 {
            return self.initial_delay.min(self.max_delay);
        }
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Returns `true` once a payload has failed too often to retry
    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }

    /// Clamps a server-provided `Retry-After` to `max_delay`
    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Parses a `Retry-After` header value
///
/// Accepts delay-seconds or an HTTP-date. Returns `None` when the value is
/// neither, so the caller falls back to its own backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let diff = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return Some(diff.to_std().unwrap_or(Duration::ZERO));
    }

    warn!(value, "Could not parse Retry-After header");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            max_attempts: 10,
        }
    }

    #[test]
    fn test_delay_doubles_per_failure() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for(6), Duration::from_secs(1920));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for(7), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_failures_uses_initial_delay() {
        assert_eq!(policy().delay_for(0), Duration::from_secs(60));
    }

    #[test]
    fn test_exhaustion() {
        let policy = policy();
        assert!(!policy.is_exhausted(9));
        assert!(policy.is_exhausted(10));
    }

    #[test]
    fn test_from_default_config() {
        assert_eq!(RetryPolicy::default(), policy());
    }

    #[test]
    fn test_clamp() {
        let policy = policy();
        assert_eq!(policy.clamp(Duration::from_secs(30)), Duration::from_secs(30));
        assert_eq!(policy.clamp(Duration::from_secs(86_400)), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("  45  "), Some(Duration::from_secs(45)));
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let past = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(parse_retry_after(past), Some(Duration::ZERO));

        let future = (chrono::Utc::now() + chrono::Duration::seconds(120)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed > Duration::from_secs(100) && parsed <= Duration::from_secs(120));
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        assert_eq!(parse_retry_after("not-a-number"), None);
        assert_eq!(parse_retry_after(""), None);
    }
}
