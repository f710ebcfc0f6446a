//! Request Throttler - client-side rate limiting for exchange REST APIs
//!
//! This crate keeps the outbound calls of an API client within the rate limits
//! the remote server publishes. Each call may count against several rules at
//! once; every rule is tracked in a bucketed sliding window, and a throttler
//! decides per call whether to send it now, delay it, or reject it.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod throttler;

pub use error::{Result, ThrottlerError};
pub use ratelimit::{RateLimitManager, RateLimitRule};
pub use throttler::{RequestThrottler, ThrottlingMode};
