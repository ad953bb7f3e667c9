//! Failure classification and bounded exponential backoff.

use std::time::Duration;

use crate::config::ApiConfig;
use crate::error::HarvestError;

/// How a failed request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 429 / quota exceeded: retry with the long backoff.
    RateLimited,
    /// Timeouts, connection failures, 5xx: retry with the short backoff.
    Transient,
    /// 404: the item no longer exists upstream.
    Gone,
    /// Other 4xx: this request will never succeed, skip the item.
    Rejected,
    /// Credentials revoked, local I/O or database failure: stop the run.
    Fatal,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::RateLimited | FailureClass::Transient)
    }
}

/// Classify an error raised while talking to the source.
pub fn classify(err: &HarvestError) -> FailureClass {
    match err {
        HarvestError::Api { status, .. } => match *status {
            429 => FailureClass::RateLimited,
            404 | 410 => FailureClass::Gone,
            401 | 403 => FailureClass::Fatal,
            s if s >= 500 => FailureClass::Transient,
            408 => FailureClass::Transient,
            _ => FailureClass::Rejected,
        },
        HarvestError::Network(_) => FailureClass::Transient,
        HarvestError::Parse(_) | HarvestError::InvalidInput(_) => FailureClass::Rejected,
        _ => FailureClass::Fatal,
    }
}

/// Retry bound and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub rate_limit_base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_secs(config.backoff_base_secs),
            rate_limit_base: Duration::from_secs(config.rate_limit_backoff_secs),
            cap: Duration::from_secs(config.backoff_cap_secs),
        }
    }

    /// No waiting between attempts. Used by tests and dry runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base: Duration::ZERO,
            rate_limit_base: Duration::ZERO,
            cap: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    /// `None` when the failure is not retryable or the bound is reached.
    pub fn delay_for(&self, class: FailureClass, attempt: u32) -> Option<Duration> {
        if !class.is_retryable() || attempt >= self.max_retries {
            return None;
        }
        let base = match class {
            FailureClass::RateLimited => self.rate_limit_base,
            _ => self.base,
        };
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(base.saturating_mul(factor).min(self.cap))
    }
}
