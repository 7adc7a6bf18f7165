//! Retry policies for rate limits and transient failures

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use std::time::Duration;

/// Default first delay of the exponential policy
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
/// Default cap on a single exponential delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Default number of exponential retries before giving up
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Epoch seconds below this are read as a delta
const EPOCH_THRESHOLD: f64 = 1_000_000_000.0;

/// Why a request is being retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// HTTP 429
    RateLimited,
    /// 5xx, timeout or connect failure
    Transient,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::RateLimited => "rate_limited",
            RetryReason::Transient => "transient",
        }
    }
}

/// How the fetcher waits before retrying
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// `min(initial * 2^n, max_delay)` for retry `n`, at most `max_retries`
    /// retries per request
    Exponential {
        initial: Duration,
        max_delay: Duration,
        max_retries: u32,
    },
    /// Sleep exactly what the server asks for in `header`, with no retry cap
    ///
    /// `fallback` is used when the header is missing or unparseable, and as
    /// the base delay for transient retries when those are enabled.
    RetryAfter { header: String, fallback: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            initial: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl BackoffPolicy {
    /// Exponential policy with the given bounds
    pub fn exponential(initial: Duration, max_delay: Duration, max_retries: u32) -> Self {
        BackoffPolicy::Exponential {
            initial,
            max_delay,
            max_retries,
        }
    }

    /// Header-driven policy (`Retry-After`, `X-Rate-Limit-Reset`, ...)
    pub fn retry_after(header: impl Into<String>) -> Self {
        BackoffPolicy::RetryAfter {
            header: header.into(),
            fallback: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `attempt` (0-based), `None` to give up
    ///
    /// `transient_retries` caps transient retries under the header-driven
    /// policy; `None` means those failures are not retried at all.
    pub fn next_delay(
        &self,
        attempt: u32,
        reason: RetryReason,
        headers: Option<&HeaderMap>,
        transient_retries: Option<u32>,
    ) -> Option<Duration> {
        match self {
            BackoffPolicy::Exponential {
                initial,
                max_delay,
                max_retries,
            } => (attempt < *max_retries).then(|| doubling(*initial, *max_delay, attempt)),
            BackoffPolicy::RetryAfter { header, fallback } => match reason {
                RetryReason::RateLimited => Some(
                    headers
                        .and_then(|h| h.get(header.as_str()))
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| parse_retry_after(v, Utc::now()))
                        .unwrap_or(*fallback),
                ),
                RetryReason::Transient => {
                    let cap = transient_retries?;
                    (attempt < cap).then(|| doubling(*fallback, DEFAULT_MAX_DELAY, attempt))
                }
            },
        }
    }
}

fn doubling(initial: Duration, max_delay: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    initial.saturating_mul(factor).min(max_delay)
}

/// Parse a retry-after style value into a delay from `now`
///
/// Accepts delta seconds (fractions allowed), absolute epoch seconds and
/// HTTP dates. Instants in the past yield a zero delay; values too large
/// for a `Duration` yield `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        if secs < EPOCH_THRESHOLD {
            return Duration::try_from_secs_f64(secs).ok();
        }
        let now_secs = now.timestamp_millis() as f64 / 1000.0;
        return Duration::try_from_secs_f64((secs - now_secs).max(0.0)).ok();
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_exponential_doubles_and_caps() {
        let policy = BackoffPolicy::exponential(
            Duration::from_millis(500),
            Duration::from_secs(3),
            5,
        );
        let delays: Vec<Option<Duration>> = (0..6)
            .map(|n| policy.next_delay(n, RetryReason::RateLimited, None, None))
            .collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(500)),
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(3)),
                Some(Duration::from_secs(3)),
                None,
            ]
        );
    }

    #[test]
    fn test_exponential_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), DEFAULT_MAX_DELAY, u32::MAX);
        assert_eq!(
            policy.next_delay(200, RetryReason::Transient, None, None),
            Some(DEFAULT_MAX_DELAY)
        );
    }

    #[test]
    fn test_parse_retry_after_forms() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_retry_after("5", now), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("0.25", now), Some(Duration::from_millis(250)));
        let epoch = now.timestamp() + 7;
        assert_eq!(
            parse_retry_after(&epoch.to_string(), now),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            parse_retry_after("Mon, 01 Jan 2024 00:00:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Sun, 31 Dec 2023 23:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-3", now), None);
    }

    #[test]
    fn test_out_of_range_reset_falls_back() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_retry_after("1e30", now), None);
        assert_eq!(parse_retry_after("99999999999999999999", now), None);

        let policy = BackoffPolicy::retry_after("X-Rate-Limit-Reset");
        let mut headers = HeaderMap::new();
        headers.insert("X-Rate-Limit-Reset", HeaderValue::from_static("1e30"));
        assert_eq!(
            policy.next_delay(0, RetryReason::RateLimited, Some(&headers), None),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_retry_after_is_uncapped_and_uses_header() {
        let policy = BackoffPolicy::retry_after("Retry-After");
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", HeaderValue::from_static("2"));
        assert_eq!(
            policy.next_delay(10_000, RetryReason::RateLimited, Some(&headers), None),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            policy.next_delay(0, RetryReason::RateLimited, None, None),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_retry_after_transient_only_when_enabled() {
        let policy = BackoffPolicy::retry_after("Retry-After");
        assert_eq!(policy.next_delay(0, RetryReason::Transient, None, None), None);
        assert_eq!(
            policy.next_delay(1, RetryReason::Transient, None, Some(3)),
            Some(Duration::from_secs(2))
        );
        assert_eq!(policy.next_delay(3, RetryReason::Transient, None, Some(3)), None);
    }
}
