//! Multi-rule admission and dispatch of outbound calls.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::mode::ThrottlingMode;
use super::request::ThrottledRequest;
use super::response::{RateLimitReached, Response, ResponseFuture};
use crate::config::ThrottlerConfig;
use crate::error::{Result, ThrottlerError};
use crate::ratelimit::{RateLimitManager, RateLimitRule};

/// Name used when a throttler is created without one.
pub const DEFAULT_API_NAME: &str = "default";

/// Keeps outbound calls of one API client within that API's rate limits.
///
/// Every distinct rule id gets exactly one [`RateLimitManager`], created the
/// first time a request carrying that rule is submitted and shared by every
/// later request. Independent throttlers never share window state.
///
/// Admission is decided synchronously inside [`submit`](Self::submit); waiting
/// out a delay happens on the tokio runtime, so callers are never blocked.
pub struct RequestThrottler {
    /// Diagnostic name of the API
    api_name: String,
    throttling_mode: ThrottlingMode,
    /// Longest delay accepted in throttle mode, unlimited when `None`
    max_throttle_delay: Option<Duration>,
    /// Window state indexed by rule id
    managers: DashMap<String, Arc<RateLimitManager>>,
    /// Origin of the millisecond clock fed to the managers
    epoch: Instant,
    /// Cancelled on dispose to drop every call still waiting for its slot
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl RequestThrottler {
    /// Create a throttler in throttle mode with no delay cap.
    pub fn new(api_name: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            throttling_mode: ThrottlingMode::default(),
            max_throttle_delay: None,
            managers: DashMap::new(),
            epoch: Instant::now(),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Create a throttler from its configuration.
    pub fn from_config(config: &ThrottlerConfig) -> Self {
        Self::new(config.api_name.clone())
            .with_throttling_mode(config.throttling_mode)
            .with_max_throttle_delay(config.max_throttle_delay())
    }

    pub fn with_throttling_mode(mut self, throttling_mode: ThrottlingMode) -> Self {
        self.throttling_mode = throttling_mode;
        self
    }

    pub fn with_max_throttle_delay(mut self, max_throttle_delay: Option<Duration>) -> Self {
        self.max_throttle_delay = max_throttle_delay;
        self
    }

    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    pub fn throttling_mode(&self) -> ThrottlingMode {
        self.throttling_mode
    }

    pub fn max_throttle_delay(&self) -> Option<Duration> {
        self.max_throttle_delay
    }

    /// Submit a call for admission.
    ///
    /// `transport` performs the call once it is admitted. The returned future
    /// resolves to the transport's response, or to a `429` response carrying
    /// [`RateLimitReached`] when the policy rejects the call. Rate limits never
    /// make this method fail; it errors only when the throttler was disposed or
    /// no tokio runtime is available to schedule the call.
    pub fn submit<R, F, Fut, T>(&self, request: R, transport: F) -> Result<ResponseFuture<T>>
    where
        R: ThrottledRequest + Send + 'static,
        F: FnOnce(R) -> Fut + Send + 'static,
        Fut: Future<Output = Response<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_disposed() {
            return Err(ThrottlerError::Disposed(self.api_name.clone()));
        }

        if self.throttling_mode == ThrottlingMode::None {
            return Ok(ResponseFuture::direct(Box::pin(transport(request))));
        }

        let runtime = Handle::try_current().map_err(|_| ThrottlerError::NoRuntime)?;

        let delay = self.required_delay(&request);
        if let Some(reached) = self.rejection(delay) {
            warn!(
                api = %self.api_name,
                mode = %self.throttling_mode,
                delay_ms = millis(delay),
                "Rate limit reached, rejecting call"
            );
            return Ok(ResponseFuture::ready(Response::rate_limited(reached)));
        }

        if !delay.is_zero() {
            debug!(
                api = %self.api_name,
                delay_ms = millis(delay),
                "Delaying call to stay within rate limits"
            );
        }

        let shutdown = self.shutdown.clone();
        let api_name = self.api_name.clone();
        let handle = runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(api = %api_name, "Throttler disposed, dropping pending call");
                    return Response::cancelled(api_name);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let mut response = transport(request).await;
            response.set_completed_at(Utc::now());
            response
        });

        Ok(ResponseFuture::scheduled(handle))
    }

    /// Consult every rule of `request` once and return the longest wait.
    fn required_delay<R: ThrottledRequest>(&self, request: &R) -> Duration {
        let now = self.now_millis();
        let weight = request.weight();

        let delay_ms = request
            .rate_limits()
            .iter()
            .map(|rule| self.manager_for(rule).request_call(now, weight))
            .max()
            .unwrap_or(0);

        trace!(
            api = %self.api_name,
            now,
            weight,
            rules = request.rate_limits().len(),
            delay_ms,
            "Evaluated rate limits"
        );

        Duration::from_millis(delay_ms)
    }

    fn rejection(&self, delay: Duration) -> Option<RateLimitReached> {
        let reject = match self.throttling_mode {
            ThrottlingMode::Block => !delay.is_zero(),
            ThrottlingMode::Throttle => self.max_throttle_delay.is_some_and(|max| delay > max),
            ThrottlingMode::None => false,
        };

        reject.then(|| {
            RateLimitReached::new(
                self.api_name.clone(),
                delay,
                self.throttling_mode,
                self.max_throttle_delay,
            )
        })
    }

    /// Get or create the manager for the rule's id.
    fn manager_for(&self, rule: &Arc<RateLimitRule>) -> Arc<RateLimitManager> {
        if let Some(manager) = self.managers.get(rule.id()) {
            return Arc::clone(manager.value());
        }

        let manager = self
            .managers
            .entry(rule.id().to_string())
            .or_insert_with(|| {
                debug!(
                    api = %self.api_name,
                    rule = %rule.id(),
                    time_frame_ms = rule.time_frame(),
                    max_request_count = ?rule.max_request_count(),
                    max_total_weight = ?rule.max_total_weight(),
                    granularity_ms = rule.granularity(),
                    "Creating rate limit manager"
                );
                Arc::new(RateLimitManager::new(Arc::clone(rule)))
            });
        Arc::clone(manager.value())
    }

    /// Get the manager tracking `rule_id`, if a request carrying it was submitted.
    pub fn manager(&self, rule_id: &str) -> Option<Arc<RateLimitManager>> {
        self.managers.get(rule_id).map(|m| Arc::clone(m.value()))
    }

    /// Get the number of rules with window state.
    pub fn manager_count(&self) -> usize {
        self.managers.len()
    }

    /// Stop the throttler.
    ///
    /// Calls still waiting for their slot resolve to a cancelled response and
    /// never reach the transport. Calls already handed to the transport finish
    /// normally. Later `submit`s fail. Calling this again has no effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        info!(api = %self.api_name, "Request throttler disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn now_millis(&self) -> u64 {
        millis(self.epoch.elapsed())
    }
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for RequestThrottler {
    fn default() -> Self {
        Self::new(DEFAULT_API_NAME)
    }
}

impl Drop for RequestThrottler {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for RequestThrottler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestThrottler")
            .field("api_name", &self.api_name)
            .field("throttling_mode", &self.throttling_mode)
            .field("max_throttle_delay", &self.max_throttle_delay)
            .field("managers", &self.managers.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
