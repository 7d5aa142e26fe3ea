//! Response classification and `Retry-After` handling
//!
//! The upstream's cooldown hint is untrusted input: it is read as integer
//! seconds, falls back to a default when missing or malformed, and is capped
//! so a buggy or hostile upstream cannot force an unbounded sleep.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::debug;

/// What a dispatched response means for the caller and the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx: hand the response back
    Success,
    /// 404: valid absence, caller skips
    NotFound,
    /// 429: degrade the credential, rotate, retry
    Throttled,
    /// 401: cached token rejected, re-exchange and retry
    Unauthorized,
    /// Anything else: hard error, not retried
    Failed(u16),
}

/// Classify an upstream HTTP status.
pub fn classify_status(status: u16) -> Outcome {
    match status {
        200..=299 => Outcome::Success,
        404 => Outcome::NotFound,
        429 => Outcome::Throttled,
        401 => Outcome::Unauthorized,
        other => Outcome::Failed(other),
    }
}

/// Bounds applied to upstream-provided cooldowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAfterPolicy {
    /// Used when the header is missing or unparseable
    pub default: Duration,
    /// Upper bound on any accepted value
    pub max: Duration,
}

impl Default for RetryAfterPolicy {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(1),
            max: Duration::from_secs(3600),
        }
    }
}

impl RetryAfterPolicy {
    /// Parse a raw `Retry-After` value.
    pub fn parse(&self, value: Option<&str>) -> Duration {
        let Some(raw) = value else {
            return self.default.min(self.max);
        };
        match raw.trim().parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs).min(self.max),
            Err(_) => {
                debug!(value = raw, "unparseable Retry-After, using default");
                self.default.min(self.max)
            }
        }
    }

    /// Read `Retry-After` from response headers.
    pub fn from_headers(&self, headers: &HeaderMap) -> Duration {
        self.parse(headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()))
    }
}
