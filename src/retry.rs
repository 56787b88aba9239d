//! Bounded exponential-backoff retry for outbound HTTP calls.
//!
//! Only transient failures are retried: connect/timeout errors, HTTP 429 and
//! 5xx responses. Everything else is handed back on the first attempt.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

/// Retry schedule for a single logical request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    /// Delay before the second attempt; doubled after each retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay, including `retry-after` hints.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Terminal outcome of a request that did not produce a 2xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    /// The request never got a response.
    Network(String),
    /// The service answered with a non-success status.
    Status { status: u16, body: String },
}

impl std::fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "request failed: {msg}"),
            Self::Status { status, body } => write!(f, "API error ({status}): {body}"),
        }
    }
}

/// Whether a status code is worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Send a request built by `build`, retrying transient failures per `policy`.
///
/// `build` is called once per attempt because a `RequestBuilder` is consumed
/// by `send`. `what` names the call in log lines.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    what: &str,
    build: F,
) -> Result<Response, HttpFailure>
where
    F: Fn() -> RequestBuilder,
{
    let attempts = policy.attempts.max(1);
    let mut retry = 0;

    loop {
        let last = retry + 1 >= attempts;

        match build().send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status();
                if last || !is_transient_status(status) {
                    let body = response.text().await.unwrap_or_default();
                    return Err(HttpFailure::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                let hinted = retry_after(&response).map(|d| d.min(policy.max_delay));
                let delay = hinted.unwrap_or_else(|| policy.delay_for(retry));
                warn!("{what}: HTTP {status}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let transient = e.is_connect() || e.is_timeout();
                if last || !transient {
                    return Err(HttpFailure::Network(e.to_string()));
                }
                let delay = policy.delay_for(retry);
                warn!("{what}: {e}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }

        retry += 1;
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for(30), Duration::from_secs(3));
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_failure_display() {
        let failure = HttpFailure::Status {
            status: 401,
            body: "bad key".into(),
        };
        assert_eq!(failure.to_string(), "API error (401): bad key");
    }

    #[tokio::test]
    async fn test_unreachable_host_gives_network_failure() {
        let client = reqwest::Client::new();
        let result = send_with_retry(&RetryPolicy::none(), "test", || {
            client.get("http://127.0.0.1:9/unreachable")
        })
        .await;
        assert!(matches!(result, Err(HttpFailure::Network(_))));
    }
}
