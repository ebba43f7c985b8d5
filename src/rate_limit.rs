//! Run-scoped quota telemetry per external service.
//!
//! One [`RateLimitState`] is created per service at the start of a run and
//! shared (via `Arc`) by every worker talking to that service. Values are
//! overwritten from each response, never accumulated, so plain atomic stores
//! are enough.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::services::ServiceProfile;
use crate::transport::HttpResponse;

const UNKNOWN_RESET: u64 = u64::MAX;

#[derive(Debug)]
pub struct RateLimitState {
    service: String,
    remaining: AtomicI64,
    reset_after_ms: AtomicU64,
    observed_at_ms: AtomicU64,
    origin: Instant,
}

impl RateLimitState {
    pub fn new(service: &str, initial_quota: i64) -> Self {
        Self {
            service: service.to_string(),
            remaining: AtomicI64::new(initial_quota),
            reset_after_ms: AtomicU64::new(UNKNOWN_RESET),
            observed_at_ms: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    pub fn for_profile(profile: &ServiceProfile) -> Self {
        Self::new(&profile.name, profile.initial_quota)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn reset_after(&self) -> Option<Duration> {
        match self.reset_after_ms.load(Ordering::Acquire) {
            UNKNOWN_RESET => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Records whatever quota signals the response carries, success or not.
    pub fn observe(&self, response: &HttpResponse, profile: &ServiceProfile) {
        let remaining = profile
            .quota_header
            .as_deref()
            .and_then(|name| response.header(name))
            .and_then(|value| value.trim().parse::<i64>().ok());
        let reset = profile
            .reset_header
            .as_deref()
            .and_then(|name| response.header(name))
            .and_then(parse_delay)
            .or_else(|| {
                profile
                    .honor_retry_after
                    .then(|| response.header("retry-after").and_then(parse_delay))
                    .flatten()
            });

        if let Some(remaining) = remaining {
            self.remaining.store(remaining, Ordering::Release);
        }
        if let Some(reset) = reset {
            let ms = u64::try_from(reset.as_millis()).unwrap_or(UNKNOWN_RESET - 1);
            self.reset_after_ms.store(ms, Ordering::Release);
            self.observed_at_ms
                .store(self.elapsed_ms(), Ordering::Release);
        }
        if remaining.is_some() || reset.is_some() {
            debug!(
                service = %self.service,
                remaining = self.remaining(),
                reset_after_ms = reset.map(|d| d.as_millis() as u64),
                "quota updated"
            );
        }
    }

    /// How long to hold a new request when the budget is spent.
    pub fn admission_delay(&self) -> Option<Duration> {
        if self.remaining() > 0 {
            return None;
        }
        let reset = self.reset_after()?;
        let since = Duration::from_millis(
            self.elapsed_ms()
                .saturating_sub(self.observed_at_ms.load(Ordering::Acquire)),
        );
        let delay = reset.saturating_sub(since);
        (!delay.is_zero()).then_some(delay)
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Parses a delay given as (possibly fractional) seconds or an HTTP-date.
pub fn parse_delay(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::from_secs_f64(secs));
        }
        return None;
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensembl() -> ServiceProfile {
        ServiceProfile::builtin("ensembl").unwrap()
    }

    #[test]
    fn starts_optimistic() {
        let state = RateLimitState::for_profile(&ensembl());
        assert_eq!(state.remaining(), 10);
        assert_eq!(state.reset_after(), None);
        assert_eq!(state.admission_delay(), None);
    }

    #[test]
    fn headers_overwrite_state() {
        let state = RateLimitState::for_profile(&ensembl());
        let response = HttpResponse::new(200, "{}")
            .with_header("X-RateLimit-Remaining", "0")
            .with_header("X-RateLimit-Reset", "40");
        state.observe(&response, &ensembl());

        assert_eq!(state.remaining(), 0);
        assert_eq!(state.reset_after(), Some(Duration::from_secs(40)));
        let delay = state.admission_delay().unwrap();
        assert!(delay <= Duration::from_secs(40));
        assert!(delay > Duration::from_secs(30));

        let response = HttpResponse::new(200, "{}").with_header("X-RateLimit-Remaining", "5");
        state.observe(&response, &ensembl());
        assert_eq!(state.remaining(), 5);
        assert_eq!(state.admission_delay(), None);
    }

    #[test]
    fn error_responses_still_update_quota() {
        let state = RateLimitState::for_profile(&ensembl());
        let response = HttpResponse::new(500, "boom").with_header("x-ratelimit-remaining", "3");
        state.observe(&response, &ensembl());
        assert_eq!(state.remaining(), 3);
    }

    #[test]
    fn delay_parsing() {
        assert_eq!(parse_delay("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_delay(" 0.5 "), Some(Duration::from_millis(500)));
        assert_eq!(parse_delay("-1"), None);
        assert_eq!(parse_delay("soon"), None);
        assert_eq!(
            parse_delay("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }
}
