//! Rate limit rules and their declarative descriptors.
//!
//! A [`RateLimitRule`] is the immutable value shared by every request that an
//! exchange governs with the same limit (a global limit, an API group limit or
//! a single endpoint limit). Rules are either built directly through the
//! factory functions or mapped 1:1 from [`RateLimitRuleDescriptor`]s loaded from
//! YAML or JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ThrottlerError};

/// Bucket width used when a rule does not specify one, in milliseconds.
pub const DEFAULT_GRANULARITY_MS: u64 = 10;

/// A single "at most N calls" or "at most W weight units" per time frame limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Key under which window state is shared across requests
    id: String,
    /// Window length in milliseconds
    time_frame: u64,
    /// Maximum number of calls per window, if the rule is count-based
    max_request_count: Option<u64>,
    /// Maximum summed weight per window, if the rule is weight-based
    max_total_weight: Option<u64>,
    /// Bucket width in milliseconds
    granularity: u64,
}

impl RateLimitRule {
    /// Create a count-based rule allowing `max_request_count` calls per `time_frame` ms.
    pub fn create_rule(id: impl Into<String>, time_frame: u64, max_request_count: u64) -> Result<Self> {
        Self::new(
            id.into(),
            time_frame,
            Some(max_request_count),
            None,
            DEFAULT_GRANULARITY_MS,
        )
    }

    /// Create a weighted rule allowing `max_total_weight` units per `time_frame` ms.
    pub fn create_weighted_rule(
        id: impl Into<String>,
        time_frame: u64,
        max_total_weight: u64,
    ) -> Result<Self> {
        Self::new(
            id.into(),
            time_frame,
            None,
            Some(max_total_weight),
            DEFAULT_GRANULARITY_MS,
        )
    }

    /// Map a declarative descriptor onto a rule.
    pub fn from_descriptor(descriptor: &RateLimitRuleDescriptor) -> Result<Self> {
        let time_frame = descriptor
            .time_frame
            .checked_mul(descriptor.time_unit.millis())
            .ok_or_else(|| {
                ThrottlerError::InvalidArgument(format!(
                    "time frame of rule `{}` overflows milliseconds",
                    descriptor.id
                ))
            })?;

        Self::new(
            descriptor.id.clone(),
            time_frame,
            limit_from_sentinel(descriptor.max_request_count),
            limit_from_sentinel(descriptor.max_total_weight),
            descriptor.granularity.unwrap_or(DEFAULT_GRANULARITY_MS),
        )
    }

    /// Map a sequence of descriptors, failing on the first invalid one.
    pub fn from_descriptors<'a, I>(descriptors: I) -> Result<Vec<Self>>
    where
        I: IntoIterator<Item = &'a RateLimitRuleDescriptor>,
    {
        descriptors.into_iter().map(Self::from_descriptor).collect()
    }

    fn new(
        id: String,
        time_frame: u64,
        max_request_count: Option<u64>,
        max_total_weight: Option<u64>,
        granularity: u64,
    ) -> Result<Self> {
        if id.is_empty() {
            return Err(ThrottlerError::InvalidArgument(
                "rate limit rule id must not be empty".to_string(),
            ));
        }
        if time_frame == 0 {
            return Err(ThrottlerError::InvalidArgument(format!(
                "rule `{}` must have a positive time frame",
                id
            )));
        }
        if max_request_count.is_none() && max_total_weight.is_none() {
            return Err(ThrottlerError::InvalidArgument(format!(
                "rule `{}` limits neither request count nor total weight",
                id
            )));
        }
        if max_request_count == Some(0) || max_total_weight == Some(0) {
            return Err(ThrottlerError::InvalidArgument(format!(
                "rule `{}` has zero capacity and could never admit a call",
                id
            )));
        }
        validate_granularity(&id, time_frame, granularity)?;

        Ok(Self {
            id,
            time_frame,
            max_request_count,
            max_total_weight,
            granularity,
        })
    }

    /// Change the bucket width. Must happen before the rule is first used.
    pub fn set_granularity(&mut self, granularity: u64) -> Result<()> {
        validate_granularity(&self.id, self.time_frame, granularity)?;
        self.granularity = granularity;
        Ok(())
    }

    /// Builder form of [`set_granularity`](Self::set_granularity).
    pub fn with_granularity(mut self, granularity: u64) -> Result<Self> {
        self.set_granularity(granularity)?;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Window length in milliseconds.
    pub fn time_frame(&self) -> u64 {
        self.time_frame
    }

    pub fn max_request_count(&self) -> Option<u64> {
        self.max_request_count
    }

    pub fn max_total_weight(&self) -> Option<u64> {
        self.max_total_weight
    }

    /// Bucket width in milliseconds.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn is_count_based(&self) -> bool {
        self.max_request_count.is_some()
    }

    pub fn is_weighted(&self) -> bool {
        self.max_total_weight.is_some()
    }

    /// Start of the bucket containing `timestamp`.
    pub(crate) fn bucket(&self, timestamp: u64) -> u64 {
        timestamp / self.granularity * self.granularity
    }

    /// The time frame rounded up to whole buckets.
    pub(crate) fn window_span(&self) -> u64 {
        self.time_frame
            .div_ceil(self.granularity)
            .saturating_mul(self.granularity)
    }
}

fn validate_granularity(id: &str, time_frame: u64, granularity: u64) -> Result<()> {
    if granularity == 0 {
        return Err(ThrottlerError::InvalidArgument(format!(
            "granularity of rule `{}` must be positive",
            id
        )));
    }
    // The window is the time frame rounded up to whole buckets
    if time_frame.div_ceil(granularity).checked_mul(granularity).is_none() {
        return Err(ThrottlerError::InvalidArgument(format!(
            "time frame of rule `{}` overflows when rounded up to {}ms buckets",
            id, granularity
        )));
    }
    Ok(())
}

/// Descriptors express "not limited" either by omission or by a negative value.
fn limit_from_sentinel(limit: Option<i64>) -> Option<u64> {
    limit.and_then(|value| u64::try_from(value).ok())
}

/// Time unit for descriptor time frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Millisecond => Duration::from_millis(1),
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }

    fn millis(&self) -> u64 {
        u64::try_from(self.duration().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Declarative form of a [`RateLimitRule`], as found in API descriptor files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRuleDescriptor {
    /// Rule id
    pub id: String,
    /// Window length, expressed in `time_unit`
    pub time_frame: u64,
    /// Unit of `time_frame`
    #[serde(default)]
    pub time_unit: TimeUnit,
    /// Maximum calls per window; absent or negative when not count-based
    #[serde(default)]
    pub max_request_count: Option<i64>,
    /// Maximum weight per window; absent or negative when not weight-based
    #[serde(default)]
    pub max_total_weight: Option<i64>,
    /// Bucket width in milliseconds
    #[serde(default)]
    pub granularity: Option<u64>,
}

/// A document listing the rate limit rules of one API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRules {
    #[serde(default)]
    pub rules: Vec<RateLimitRuleDescriptor>,
}

impl RateLimitRules {
    /// Load rules from a file; `.json` files are read as JSON, anything else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // A bare list of descriptors is accepted as well as a `rules:` document
        if let Ok(rules) = serde_yaml::from_str::<Vec<RateLimitRuleDescriptor>>(yaml) {
            return Ok(Self { rules });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottlerError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Load rules from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        if let Ok(rules) = serde_json::from_str::<Vec<RateLimitRuleDescriptor>>(json) {
            return Ok(Self { rules });
        }

        serde_json::from_str(json)
            .map_err(|e| ThrottlerError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Validate every descriptor and index the resulting rules by id.
    pub fn build(&self) -> Result<HashMap<String, Arc<RateLimitRule>>> {
        let mut rules = HashMap::with_capacity(self.rules.len());
        for rule in RateLimitRule::from_descriptors(&self.rules)? {
            let id = rule.id().to_string();
            if rules.insert(id.clone(), Arc::new(rule)).is_some() {
                return Err(ThrottlerError::Config(format!(
                    "rate limit rule `{}` is defined more than once",
                    id
                )));
            }
        }
        Ok(rules)
    }
}
