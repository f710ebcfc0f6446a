//! Policy applied when a request would exceed a rate limit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ThrottlerError;

/// What a [`RequestThrottler`](super::RequestThrottler) does with a call that
/// does not fit its rate limits right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottlingMode {
    /// Delay the call until every rule admits it
    #[default]
    Throttle,
    /// Answer immediately with a rate-limit rejection
    Block,
    /// Forward every call without consulting the rules
    None,
}

impl fmt::Display for ThrottlingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThrottlingMode::Throttle => "throttle",
            ThrottlingMode::Block => "block",
            ThrottlingMode::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for ThrottlingMode {
    type Err = ThrottlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "throttle" => Ok(ThrottlingMode::Throttle),
            "block" => Ok(ThrottlingMode::Block),
            "none" => Ok(ThrottlingMode::None),
            other => Err(ThrottlerError::InvalidArgument(format!(
                "unknown throttling mode `{}`",
                other
            ))),
        }
    }
}
