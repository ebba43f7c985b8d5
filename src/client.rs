//! Service-aware request loop on top of [`RetryableHttpExecutor`].
//!
//! Responses are sorted into classes. Rate-limit signals make the loop wait
//! the advertised duration (never less than
//! [`ServiceProfile::min_rate_limit_wait`]) and re-issue the request; both the
//! total wait and the number of re-issues are capped per request. A 2xx body
//! carrying an error marker, and gateway errors, are retried a fixed number
//! of times with a fixed delay. Everything else is terminal.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::Sleeper;
use crate::domain::FetchUsage;
use crate::error::XrefError;
use crate::executor::RetryableHttpExecutor;
use crate::rate_limit::{RateLimitState, parse_delay};
use crate::services::ServiceProfile;
use crate::transport::{HttpRequest, HttpResponse};

const BODY_SNIPPET_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    NotFound,
    RateLimited,
    RetryableServerError,
    TerminalError,
    /// 2xx status with an application-level error in the body.
    DeceptiveSuccess,
}

#[derive(Debug, Clone)]
pub struct ServiceResult {
    pub class: ResponseClass,
    pub status: u16,
    pub body: Vec<u8>,
    /// Set for [`ResponseClass::RateLimited`]: how long to wait before re-issuing.
    pub wait_time: Option<Duration>,
    pub attempts: u32,
}

/// Payload of a successful request plus what it cost to get it.
#[derive(Debug, Clone)]
pub struct ServiceFetch {
    pub body: Vec<u8>,
    pub attempts: u32,
    pub total_wait: Duration,
}

#[derive(Clone)]
pub struct RateLimitAwareClient {
    executor: RetryableHttpExecutor,
    sleeper: Arc<dyn Sleeper>,
}

impl RateLimitAwareClient {
    pub fn new(executor: RetryableHttpExecutor, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { executor, sleeper }
    }

    /// One exchange: send, update the quota state, classify.
    pub fn execute_with_quota(
        &self,
        request: &HttpRequest,
        profile: &ServiceProfile,
        state: &RateLimitState,
        max_connect_retries: u32,
    ) -> Result<ServiceResult, XrefError> {
        let exchange =
            self.executor
                .execute(request, profile.connect_timeout, max_connect_retries)?;
        state.observe(&exchange.response, profile);
        let (class, wait_time) = classify(&exchange.response, profile);
        Ok(ServiceResult {
            class,
            status: exchange.response.status,
            body: exchange.response.body,
            wait_time,
            attempts: exchange.attempts,
        })
    }

    /// Issues `request` until it yields a payload or a terminal error.
    pub fn fetch(
        &self,
        request: &HttpRequest,
        profile: &ServiceProfile,
        state: &RateLimitState,
        max_connect_retries: u32,
    ) -> Result<ServiceFetch, XrefError> {
        let mut usage = FetchUsage::default();
        let body = self.fetch_counted(request, profile, state, max_connect_retries, &mut usage)?;
        Ok(ServiceFetch {
            body,
            attempts: usage.attempts,
            total_wait: usage.total_wait,
        })
    }

    /// Like [`Self::fetch`], adding requests sent and time waited to `usage`
    /// whether or not the fetch succeeds.
    pub fn fetch_counted(
        &self,
        request: &HttpRequest,
        profile: &ServiceProfile,
        state: &RateLimitState,
        max_connect_retries: u32,
        usage: &mut FetchUsage,
    ) -> Result<Vec<u8>, XrefError> {
        let mut rate_limit_wait = Duration::ZERO;
        let mut rate_limited = 0u32;
        let mut soft_failures = 0u32;

        loop {
            if profile.admission_control {
                if let Some(delay) = state.admission_delay() {
                    info!(
                        service = %profile.name,
                        wait_ms = delay.as_millis() as u64,
                        "quota exhausted, holding request"
                    );
                    rate_limit_wait =
                        self.wait_rate_limit(request, profile, rate_limit_wait, delay, usage)?;
                }
            }

            let result = match self.execute_with_quota(request, profile, state, max_connect_retries)
            {
                Ok(result) => result,
                Err(err) => {
                    usage.attempts += err.transfer_attempts().unwrap_or(0);
                    return Err(err);
                }
            };
            usage.attempts += result.attempts;

            match result.class {
                ResponseClass::Success => {
                    debug!(
                        service = %profile.name,
                        url = %request.url,
                        attempts = usage.attempts,
                        "request succeeded"
                    );
                    return Ok(result.body);
                }
                ResponseClass::RateLimited => {
                    rate_limited += 1;
                    if rate_limited > profile.max_rate_limit_retries {
                        return Err(XrefError::RateLimitExhausted {
                            service: profile.name.clone(),
                            url: request.url.clone(),
                            waited: rate_limit_wait,
                        });
                    }
                    let wait = result
                        .wait_time
                        .unwrap_or(profile.deceptive_retry_delay)
                        .max(profile.min_rate_limit_wait);
                    info!(
                        service = %profile.name,
                        url = %request.url,
                        wait_ms = wait.as_millis() as u64,
                        remaining = state.remaining(),
                        attempt = rate_limited,
                        "rate limited, waiting before retry"
                    );
                    rate_limit_wait =
                        self.wait_rate_limit(request, profile, rate_limit_wait, wait, usage)?;
                }
                ResponseClass::DeceptiveSuccess | ResponseClass::RetryableServerError => {
                    soft_failures += 1;
                    if soft_failures >= profile.deceptive_retry_cap {
                        return Err(exhausted(request, profile, &result, soft_failures));
                    }
                    warn!(
                        service = %profile.name,
                        url = %request.url,
                        status = result.status,
                        attempt = soft_failures,
                        body = %snippet(&result.body),
                        "service reported an error, retrying"
                    );
                    self.sleeper.sleep(profile.deceptive_retry_delay)?;
                    usage.total_wait += profile.deceptive_retry_delay;
                }
                ResponseClass::NotFound | ResponseClass::TerminalError => {
                    return Err(XrefError::ServiceStatus {
                        service: profile.name.clone(),
                        url: request.url.clone(),
                        status: result.status,
                        message: snippet(&result.body),
                    });
                }
            }
        }
    }

    fn wait_rate_limit(
        &self,
        request: &HttpRequest,
        profile: &ServiceProfile,
        waited: Duration,
        wait: Duration,
        usage: &mut FetchUsage,
    ) -> Result<Duration, XrefError> {
        if waited + wait > profile.max_rate_limit_wait {
            return Err(XrefError::RateLimitExhausted {
                service: profile.name.clone(),
                url: request.url.clone(),
                waited,
            });
        }
        self.sleeper.sleep(wait)?;
        usage.total_wait += wait;
        Ok(waited + wait)
    }
}

pub fn classify(
    response: &HttpResponse,
    profile: &ServiceProfile,
) -> (ResponseClass, Option<Duration>) {
    let status = response.status;
    if (200..300).contains(&status) {
        let text = String::from_utf8_lossy(&response.body);
        let has_error = profile
            .error_markers
            .iter()
            .any(|marker| text.contains(marker.as_str()));
        let missing_success = profile
            .success_marker
            .as_deref()
            .is_some_and(|marker| !text.contains(marker));
        if has_error || missing_success {
            return (ResponseClass::DeceptiveSuccess, None);
        }
        return (ResponseClass::Success, None);
    }

    let throttling_status =
        matches!(status, 429 | 503) || profile.retryable_statuses.contains(&status);
    let retry_after = (profile.honor_retry_after && throttling_status)
        .then(|| response.header("retry-after").and_then(parse_delay))
        .flatten();
    if let Some(wait) = retry_after {
        return (ResponseClass::RateLimited, Some(wait));
    }
    if status == 429 {
        let reset = profile
            .reset_header
            .as_deref()
            .and_then(|name| response.header(name))
            .and_then(parse_delay);
        return (ResponseClass::RateLimited, reset);
    }
    if status == 404 {
        return (ResponseClass::NotFound, None);
    }
    if profile.retryable_statuses.contains(&status) {
        return (ResponseClass::RetryableServerError, None);
    }
    (ResponseClass::TerminalError, None)
}

fn exhausted(
    request: &HttpRequest,
    profile: &ServiceProfile,
    result: &ServiceResult,
    attempts: u32,
) -> XrefError {
    if result.class == ResponseClass::DeceptiveSuccess {
        XrefError::QueryFailed {
            service: profile.name.clone(),
            url: request.url.clone(),
            attempts,
            last_body: String::from_utf8_lossy(&result.body).into_owned(),
        }
    } else {
        XrefError::ServiceStatus {
            service: profile.name.clone(),
            url: request.url.clone(),
            status: result.status,
            message: snippet(&result.body),
        }
    }
}

fn snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(BODY_SNIPPET_CHARS)
        .collect()
}
