//! The view of an outbound request that the throttler needs.

use std::sync::Arc;

use crate::ratelimit::RateLimitRule;

/// A request governed by zero or more rate limit rules.
pub trait ThrottledRequest {
    /// Every rule this call counts against (global, API group, endpoint...).
    fn rate_limits(&self) -> &[Arc<RateLimitRule>];

    /// Weight the call consumes under weighted rules.
    fn weight(&self) -> u32 {
        1
    }
}

/// A plain request description for callers without their own request type.
#[derive(Debug, Clone)]
pub struct RestRequest {
    endpoint: String,
    rate_limits: Vec<Arc<RateLimitRule>>,
    weight: u32,
}

impl RestRequest {
    /// Create a weight-1 request for `endpoint` with no rules attached.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            rate_limits: Vec::new(),
            weight: 1,
        }
    }

    pub fn with_rate_limit(mut self, rule: Arc<RateLimitRule>) -> Self {
        self.rate_limits.push(rule);
        self
    }

    pub fn with_rate_limits<I>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = Arc<RateLimitRule>>,
    {
        self.rate_limits.extend(rules);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ThrottledRequest for RestRequest {
    fn rate_limits(&self) -> &[Arc<RateLimitRule>] {
        &self.rate_limits
    }

    fn weight(&self) -> u32 {
        self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_request_defaults() {
        let request = RestRequest::new("/api/v3/time");
        assert_eq!(request.endpoint(), "/api/v3/time");
        assert!(request.rate_limits().is_empty());
        assert_eq!(request.weight(), 1);
    }

    #[test]
    fn test_rest_request_builder() {
        let global = Arc::new(RateLimitRule::create_weighted_rule("global", 60_000, 1200).unwrap());
        let orders = Arc::new(RateLimitRule::create_rule("orders", 10_000, 50).unwrap());

        let request = RestRequest::new("/api/v3/order")
            .with_rate_limit(global)
            .with_rate_limits([orders])
            .with_weight(4);

        let ids: Vec<_> = request.rate_limits().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["global", "orders"]);
        assert_eq!(request.weight(), 4);
    }
}
