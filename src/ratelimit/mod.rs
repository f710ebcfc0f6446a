//! Rate limit rules and sliding-window state.

mod manager;
mod rules;

pub use manager::{RateLimitManager, RateLimitStat};
pub use rules::{
    RateLimitRule, RateLimitRuleDescriptor, RateLimitRules, TimeUnit, DEFAULT_GRANULARITY_MS,
};
