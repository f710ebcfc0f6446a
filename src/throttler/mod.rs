//! Request admission: policy, dispatch and the request/response boundary.

mod mode;
mod request;
mod response;
#[allow(clippy::module_inception)]
mod throttler;

pub use mode::ThrottlingMode;
pub use request::{RestRequest, ThrottledRequest};
pub use response::{
    RateLimitReached, Response, ResponseError, ResponseFuture, NO_STATUS, TOO_MANY_REQUESTS,
};
pub use throttler::{RequestThrottler, DEFAULT_API_NAME};
