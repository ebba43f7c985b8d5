//! Connect-phase retry around a [`Transport`].
//!
//! Only connect timeouts are retried. Each retry widens the connect timeout
//! by a fixed increment (30s, 40s, 50s, ... with the defaults). Failures after
//! the connection is live are surfaced immediately so a half-finished
//! transfer is never silently repeated.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::XrefError;
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT_INCREMENT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A response plus the number of attempts it took to get it.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub response: HttpResponse,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct RetryableHttpExecutor {
    transport: Arc<dyn Transport>,
    timeout_increment: Duration,
    cancel: CancellationToken,
}

impl RetryableHttpExecutor {
    pub fn new(transport: Arc<dyn Transport>, cancel: CancellationToken) -> Self {
        Self {
            transport,
            timeout_increment: DEFAULT_TIMEOUT_INCREMENT,
            cancel,
        }
    }

    pub fn with_timeout_increment(mut self, increment: Duration) -> Self {
        self.timeout_increment = increment;
        self
    }

    /// Connect timeout used for a 1-indexed attempt.
    pub fn timeout_for_attempt(&self, initial: Duration, attempt: u32) -> Duration {
        initial + self.timeout_increment * attempt.saturating_sub(1)
    }

    pub fn execute(
        &self,
        request: &HttpRequest,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Exchange, XrefError> {
        let max_attempts = max_retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            self.cancel.check()?;
            attempt += 1;
            let connect_timeout = self.timeout_for_attempt(timeout, attempt);
            debug!(
                url = %request.url,
                attempt,
                connect_timeout_secs = connect_timeout.as_secs(),
                "sending request"
            );
            match self.transport.send(request, connect_timeout) {
                Ok(response) => {
                    return Ok(Exchange {
                        response,
                        attempts: attempt,
                    });
                }
                Err(TransportError::ConnectTimeout(cause)) => {
                    if attempt >= max_attempts {
                        return Err(XrefError::ConnectionFailure {
                            url: request.url.clone(),
                            attempts: attempt,
                            cause,
                        });
                    }
                    warn!(
                        url = %request.url,
                        attempt,
                        next_timeout_secs = self.timeout_for_attempt(timeout, attempt + 1).as_secs(),
                        "connect timed out, retrying"
                    );
                }
                Err(TransportError::HostUnreachable(cause)) => {
                    return Err(XrefError::HostUnreachable {
                        url: request.url.clone(),
                        attempts: attempt,
                        cause,
                    });
                }
                Err(TransportError::Io(cause)) => {
                    return Err(XrefError::IoFailure {
                        url: request.url.clone(),
                        attempts: attempt,
                        cause,
                    });
                }
                Err(TransportError::Invalid(cause)) => {
                    return Err(XrefError::InvalidRequest {
                        url: request.url.clone(),
                        attempts: attempt,
                        cause,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    struct Scripted {
        replies: Mutex<Vec<Result<HttpResponse, TransportError>>>,
        timeouts: Mutex<Vec<Duration>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                timeouts: Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for Scripted {
        fn send(
            &self,
            _request: &HttpRequest,
            connect_timeout: Duration,
        ) -> Result<HttpResponse, TransportError> {
            self.timeouts.lock().unwrap().push(connect_timeout);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(TransportError::ConnectTimeout("timed out".to_string())))
        }
    }

    fn executor(transport: Arc<Scripted>) -> RetryableHttpExecutor {
        RetryableHttpExecutor::new(transport, CancellationToken::new())
    }

    #[test]
    fn connect_timeouts_grow_linearly() {
        let transport = Scripted::new(vec![
            Err(TransportError::ConnectTimeout("t".to_string())),
            Err(TransportError::ConnectTimeout("t".to_string())),
            Ok(HttpResponse::new(200, "ok")),
        ]);
        let exchange = executor(transport.clone())
            .execute(&HttpRequest::get("https://example.org"), DEFAULT_CONNECT_TIMEOUT, 5)
            .unwrap();

        assert_eq!(exchange.attempts, 3);
        assert_eq!(
            *transport.timeouts.lock().unwrap(),
            vec![
                Duration::from_secs(30),
                Duration::from_secs(40),
                Duration::from_secs(50)
            ]
        );
    }

    #[test]
    fn exhausted_retries_report_attempts() {
        let transport = Scripted::new(Vec::new());
        let err = executor(transport.clone())
            .execute(&HttpRequest::get("https://example.org"), DEFAULT_CONNECT_TIMEOUT, 2)
            .unwrap_err();

        assert_matches!(err, XrefError::ConnectionFailure { attempts: 3, .. });
        assert_eq!(transport.timeouts.lock().unwrap().len(), 3);
    }

    #[test]
    fn unreachable_host_is_not_retried() {
        let transport = Scripted::new(vec![Err(TransportError::HostUnreachable(
            "dns".to_string(),
        ))]);
        let err = executor(transport.clone())
            .execute(&HttpRequest::get("https://example.org"), DEFAULT_CONNECT_TIMEOUT, 5)
            .unwrap_err();

        assert_matches!(err, XrefError::HostUnreachable { attempts: 1, .. });
        assert_eq!(transport.timeouts.lock().unwrap().len(), 1);
    }

    #[test]
    fn stream_failure_is_not_retried() {
        let transport = Scripted::new(vec![Err(TransportError::Io("reset".to_string()))]);
        let err = executor(transport.clone())
            .execute(&HttpRequest::get("https://example.org"), DEFAULT_CONNECT_TIMEOUT, 5)
            .unwrap_err();

        assert_matches!(err, XrefError::IoFailure { .. });
        assert_eq!(transport.timeouts.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancelled_executor_sends_nothing() {
        let transport = Scripted::new(vec![Ok(HttpResponse::new(200, "ok"))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = RetryableHttpExecutor::new(transport.clone(), cancel)
            .execute(&HttpRequest::get("https://example.org"), DEFAULT_CONNECT_TIMEOUT, 5)
            .unwrap_err();

        assert_matches!(err, XrefError::Cancelled);
        assert!(transport.timeouts.lock().unwrap().is_empty());
    }

    #[test]
    fn custom_increment_applies_per_retry() {
        let tuned = executor(Scripted::new(Vec::new()))
            .with_timeout_increment(Duration::from_secs(5));
        assert_eq!(
            tuned.timeout_for_attempt(Duration::from_secs(10), 1),
            Duration::from_secs(10)
        );
        assert_eq!(
            tuned.timeout_for_attempt(Duration::from_secs(10), 4),
            Duration::from_secs(25)
        );
    }

    #[test]
    fn failure_after_timeouts_counts_every_attempt() {
        let transport = Scripted::new(vec![
            Err(TransportError::ConnectTimeout("t".to_string())),
            Err(TransportError::Io("reset".to_string())),
        ]);
        let err = executor(transport)
            .execute(&HttpRequest::get("https://example.org"), DEFAULT_CONNECT_TIMEOUT, 5)
            .unwrap_err();

        assert_matches!(err, XrefError::IoFailure { attempts: 2, .. });
        assert_eq!(err.transfer_attempts(), Some(2));
    }
}
