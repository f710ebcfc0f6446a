//! Responses produced by throttled calls.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::mode::ThrottlingMode;

/// Status code of a rate-limit rejection.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Status code of a response for which no HTTP exchange took place.
pub const NO_STATUS: u16 = 0;

/// A call was turned away because the throttling policy forbids waiting for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit reached on `{api_name}`: call would have to wait {}ms", .required_delay.as_millis())]
pub struct RateLimitReached {
    api_name: String,
    required_delay: Duration,
    mode: ThrottlingMode,
    max_throttle_delay: Option<Duration>,
}

impl RateLimitReached {
    pub(crate) fn new(
        api_name: impl Into<String>,
        required_delay: Duration,
        mode: ThrottlingMode,
        max_throttle_delay: Option<Duration>,
    ) -> Self {
        Self {
            api_name: api_name.into(),
            required_delay,
            mode,
            max_throttle_delay,
        }
    }

    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    /// How long the call would have had to wait to stay within every rule.
    pub fn required_delay(&self) -> Duration {
        self.required_delay
    }

    pub fn mode(&self) -> ThrottlingMode {
        self.mode
    }

    pub fn max_throttle_delay(&self) -> Option<Duration> {
        self.max_throttle_delay
    }
}

/// Failure carried inside a [`Response`].
#[derive(Debug, Error)]
pub enum ResponseError {
    /// Rejected by the throttling policy
    #[error(transparent)]
    RateLimitReached(#[from] RateLimitReached),

    /// The throttler was disposed while the call was waiting for its slot
    #[error("Call cancelled before dispatch: throttler `{0}` was disposed")]
    Cancelled(String),

    /// Failure reported by the transport
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The task running the call did not finish
    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

/// Outcome of a call: an HTTP status, an optional body and an optional error.
#[derive(Debug)]
pub struct Response<T> {
    status_code: u16,
    body: Option<T>,
    error: Option<ResponseError>,
    completed_at: Option<DateTime<Utc>>,
}

impl<T> Response<T> {
    /// A `200` response carrying `body`.
    pub fn ok(body: T) -> Self {
        Self::with_status(200, Some(body))
    }

    pub fn with_status(status_code: u16, body: Option<T>) -> Self {
        Self {
            status_code,
            body,
            error: None,
            completed_at: None,
        }
    }

    /// A response for a call the transport could not complete.
    pub fn failed(
        status_code: u16,
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::from_error(status_code, ResponseError::Transport(error.into()))
    }

    pub(crate) fn rate_limited(reached: RateLimitReached) -> Self {
        let mut response = Self::from_error(TOO_MANY_REQUESTS, reached.into());
        response.completed_at = Some(Utc::now());
        response
    }

    pub(crate) fn cancelled(api_name: impl Into<String>) -> Self {
        let mut response = Self::from_error(NO_STATUS, ResponseError::Cancelled(api_name.into()));
        response.completed_at = Some(Utc::now());
        response
    }

    fn dispatch_failed(reason: String) -> Self {
        let mut response = Self::from_error(NO_STATUS, ResponseError::Dispatch(reason));
        response.completed_at = Some(Utc::now());
        response
    }

    fn from_error(status_code: u16, error: ResponseError) -> Self {
        Self {
            status_code,
            body: None,
            error: Some(error),
            completed_at: None,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn body(&self) -> Option<&T> {
        self.body.as_ref()
    }

    pub fn into_body(self) -> Option<T> {
        self.body
    }

    pub fn error(&self) -> Option<&ResponseError> {
        self.error.as_ref()
    }

    /// The rejection, if the throttling policy turned this call away.
    pub fn rate_limit_reached(&self) -> Option<&RateLimitReached> {
        match &self.error {
            Some(ResponseError::RateLimitReached(reached)) => Some(reached),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status_code)
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn set_completed_at(&mut self, completed_at: DateTime<Utc>) {
        self.completed_at = Some(completed_at);
    }
}

/// Handle to the eventual [`Response`] of a submitted call.
///
/// Dropping the handle does not cancel a scheduled call.
pub struct ResponseFuture<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Direct(BoxFuture<'static, Response<T>>),
    Scheduled(JoinHandle<Response<T>>),
}

impl<T> ResponseFuture<T> {
    pub(crate) fn direct(future: BoxFuture<'static, Response<T>>) -> Self {
        Self {
            inner: Inner::Direct(future),
        }
    }

    pub(crate) fn ready(response: Response<T>) -> Self
    where
        T: Send + 'static,
    {
        Self::direct(Box::pin(futures::future::ready(response)))
    }

    pub(crate) fn scheduled(handle: JoinHandle<Response<T>>) -> Self {
        Self {
            inner: Inner::Scheduled(handle),
        }
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Response<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Direct(future) => future.as_mut().poll(cx),
            Inner::Scheduled(handle) => match ready!(Pin::new(handle).poll(cx)) {
                Ok(response) => Poll::Ready(response),
                Err(e) => Poll::Ready(Response::dispatch_failed(e.to_string())),
            },
        }
    }
}

impl<T> std::fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            Inner::Direct(_) => "direct",
            Inner::Scheduled(_) => "scheduled",
        };
        f.debug_struct("ResponseFuture").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_response() {
        let response = Response::ok("pong");
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.body(), Some(&"pong"));
        assert!(response.is_success());
        assert!(response.completed_at().is_none());
    }

    #[test]
    fn test_failed_response_keeps_transport_error() {
        let response: Response<()> = Response::failed(502, "bad gateway");
        assert!(!response.is_success());
        assert!(matches!(response.error(), Some(ResponseError::Transport(_))));
        assert_eq!(response.error().unwrap().to_string(), "Transport error: bad gateway");
    }

    #[test]
    fn test_rate_limited_response() {
        let reached = RateLimitReached::new(
            "spot",
            Duration::from_millis(1010),
            ThrottlingMode::Block,
            None,
        );
        let response: Response<()> = Response::rate_limited(reached.clone());

        assert_eq!(response.status_code(), TOO_MANY_REQUESTS);
        assert_eq!(response.rate_limit_reached(), Some(&reached));
        assert!(response.completed_at().is_some());
        assert_eq!(
            reached.to_string(),
            "rate limit reached on `spot`: call would have to wait 1010ms"
        );
    }

    #[tokio::test]
    async fn test_ready_future_resolves() {
        let response = ResponseFuture::ready(Response::ok(7)).await;
        assert_eq!(response.into_body(), Some(7));
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_dispatch_error() {
        let handle: JoinHandle<Response<()>> = tokio::spawn(async { panic!("transport exploded") });
        let response = ResponseFuture::scheduled(handle).await;
        assert_eq!(response.status_code(), NO_STATUS);
        assert!(matches!(response.error(), Some(ResponseError::Dispatch(_))));
    }
}
