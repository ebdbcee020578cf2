//! HTTP client for the Graph API
//!
//! Wraps `reqwest::Client` with bearer authentication, base-URL
//! construction, a per-request timeout, and a concurrent-request limit.
//! Non-success statuses are mapped onto [`CoreError`] kinds exactly once,
//! here; callers never inspect raw status codes.

use std::{sync::Arc, time::Duration};

use cirrus_core::domain::CoreError;
use cirrus_core::ports::TokenSource;
use reqwest::{header::HeaderMap, Method, RequestBuilder, Response, StatusCode};
use tokio::sync::Semaphore;
use tracing::debug;

/// Base URL for Microsoft Graph API v1.0
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Retry-After fallback when the header is missing or unparsable.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Client configuration (spec'd surface: base URL, timeout, concurrency,
/// user agent; the bearer token comes from the injected [`TokenSource`]).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API base URL; overridable for tests
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Maximum concurrent in-flight requests
    pub max_concurrent: usize,
    /// User-Agent header value
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: GRAPH_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            max_concurrent: 8,
            user_agent: format!("cirrusfs/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Authenticated HTTP client for Graph API calls
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    limiter: Arc<Semaphore>,
}

impl GraphClient {
    /// Creates a client with the given token source and configuration.
    pub fn new(tokens: Arc<dyn TokenSource>, config: &ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            base_url: config.base_url.clone(),
            tokens,
            limiter: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        }
    }

    /// Returns the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds an authenticated request for a path relative to the base URL.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, CoreError> {
        let url = format!("{}{}", self.base_url, path);
        self.request_absolute(method, &url).await
    }

    /// Builds an authenticated request for an absolute URL (upload-session
    /// URLs live outside the base URL).
    pub async fn request_absolute(
        &self,
        method: Method,
        url: &str,
    ) -> Result<RequestBuilder, CoreError> {
        let bearer = self.tokens.bearer().await?;
        Ok(self.http.request(method, url).bearer_auth(bearer))
    }

    /// Sends a request under the concurrency limit and maps transport
    /// errors. The status is not inspected; pair with
    /// [`GraphClient::expect_success`] unless the caller branches on
    /// specific statuses (conditional download, chunk upload).
    pub async fn execute(&self, request: RequestBuilder) -> Result<Response, CoreError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| CoreError::Cancelled)?;
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                CoreError::Transient(format!("request timed out: {e}"))
            } else {
                CoreError::Transient(format!("transport error: {e}"))
            }
        })
    }

    /// Returns the response if it is a success status; otherwise consumes
    /// it into the mapped [`CoreError`].
    pub async fn expect_success(&self, response: Response) -> Result<Response, CoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(error_for_response(response).await)
    }
}

/// Maps a non-success response onto the corresponding error kind,
/// consuming the body for the message.
pub(crate) async fn error_for_response(response: Response) -> CoreError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    map_status(status, &headers, detail)
}

/// Status → error-kind mapping. 401, 404, 409, 412, and 429 are reported
/// distinctly so the managers can react per spec.
pub(crate) fn map_status(status: StatusCode, headers: &HeaderMap, detail: String) -> CoreError {
    match status {
        StatusCode::UNAUTHORIZED => CoreError::AuthExpired,
        StatusCode::FORBIDDEN => CoreError::PermissionDenied(detail),
        StatusCode::NOT_FOUND | StatusCode::GONE => CoreError::NotFound(detail),
        StatusCode::CONFLICT => CoreError::Conflict(detail),
        StatusCode::PRECONDITION_FAILED => CoreError::Precondition(detail),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = headers
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .map(|v| parse_retry_after(v, DEFAULT_RETRY_AFTER))
                .unwrap_or(DEFAULT_RETRY_AFTER);
            debug!(retry_after_ms = retry_after.as_millis() as u64, "throttled");
            CoreError::RateLimited { retry_after }
        }
        StatusCode::BAD_REQUEST => CoreError::Invalid(detail),
        s if s.is_server_error() => CoreError::Transient(detail),
        _ => CoreError::Transient(detail),
    }
}

/// Parses a `Retry-After` header value: either delay-seconds or an
/// HTTP-date. Falls back to `default` on anything unparsable.
pub fn parse_retry_after(value: &str, default: Duration) -> Duration {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Duration::from_secs(secs);
    }
    if let Ok(when) = chrono::DateTime::parse_from_rfc2822(value) {
        let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
        if let Ok(positive) = delta.to_std() {
            return positive;
        }
        return Duration::ZERO;
    }
    default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after("120", DEFAULT_RETRY_AFTER),
            Duration::from_secs(120)
        );
        assert_eq!(
            parse_retry_after(" 5 ", DEFAULT_RETRY_AFTER),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_parse_retry_after_http_date_in_past() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", DEFAULT_RETRY_AFTER),
            Duration::ZERO
        );
    }

    #[test]
    fn test_parse_retry_after_garbage_uses_default() {
        assert_eq!(
            parse_retry_after("soon", DEFAULT_RETRY_AFTER),
            DEFAULT_RETRY_AFTER
        );
    }

    #[test]
    fn test_map_status_distinctions() {
        let headers = HeaderMap::new();
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, &headers, String::new()),
            CoreError::AuthExpired
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, &headers, String::new()),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            map_status(StatusCode::CONFLICT, &headers, String::new()),
            CoreError::Conflict(_)
        ));
        assert!(matches!(
            map_status(StatusCode::PRECONDITION_FAILED, &headers, String::new()),
            CoreError::Precondition(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, &headers, String::new()),
            CoreError::Transient(_)
        ));
    }

    #[test]
    fn test_map_429_carries_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", "7".parse().unwrap());
        match map_status(StatusCode::TOO_MANY_REQUESTS, &headers, String::new()) {
            CoreError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(7));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }
}
