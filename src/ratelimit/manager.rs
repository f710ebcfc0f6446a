//! Sliding-window admission for a single rate limit rule.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::trace;

use super::rules::RateLimitRule;

/// Snapshot of a manager's window as of its last evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitStat {
    /// The `now` of the last evaluation, in milliseconds
    pub time: u64,
    /// Accepted calls still inside the window
    pub request_count: u64,
    /// Summed weight of the accepted calls still inside the window
    pub total_weight: u64,
}

/// Accepted calls that fell into the same granularity bucket.
#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    request_count: u64,
    total_weight: u64,
}

#[derive(Debug, Default)]
struct Window {
    /// Buckets keyed by their start time, oldest first
    buckets: BTreeMap<u64, Bucket>,
    request_count: u64,
    total_weight: u64,
    last_evaluated: u64,
}

impl Window {
    /// Drop every bucket whose end of window lies at or before `now_bucket`.
    fn purge(&mut self, now_bucket: u64, window_span: u64) {
        let Some(cutoff) = now_bucket.checked_sub(window_span) else {
            return;
        };
        let retained = self.buckets.split_off(&(cutoff + 1));
        for expired in std::mem::replace(&mut self.buckets, retained).into_values() {
            self.request_count -= expired.request_count;
            self.total_weight -= expired.total_weight;
        }
    }

    fn record(&mut self, bucket: u64, weight: u64) {
        let entry = self.buckets.entry(bucket).or_default();
        entry.request_count += 1;
        entry.total_weight += weight;
        self.request_count += 1;
        self.total_weight += weight;
    }
}

/// Tracks the capacity consumed under one [`RateLimitRule`].
///
/// Calls are accounted per granularity bucket, so the bookkeeping is bounded by
/// the number of buckets in a window rather than by the number of calls. The
/// caller always supplies `now`; the manager never reads a clock on its own,
/// which keeps every decision reproducible.
///
/// A manager is safe to share between threads. Each evaluation holds the
/// manager's lock for the whole purge, check and record sequence.
#[derive(Debug)]
pub struct RateLimitManager {
    rule: Arc<RateLimitRule>,
    window: Mutex<Window>,
}

impl RateLimitManager {
    /// Create a manager with an empty window.
    pub fn new(rule: Arc<RateLimitRule>) -> Self {
        Self {
            rule,
            window: Mutex::new(Window::default()),
        }
    }

    /// Get the rule this manager enforces.
    pub fn rule(&self) -> &Arc<RateLimitRule> {
        &self.rule
    }

    /// Ask to place a call of `weight` at time `now` (milliseconds).
    ///
    /// Returns `0` when the call is admitted and recorded. Otherwise returns the
    /// number of milliseconds to wait before the call would fit, and records
    /// nothing.
    pub fn request_call(&self, now: u64, weight: u32) -> u64 {
        let rule = &*self.rule;
        let granularity = rule.granularity();
        let window_span = rule.window_span();
        let now_bucket = rule.bucket(now);

        let mut window = self.window.lock();
        window.purge(now_bucket, window_span);
        window.last_evaluated = now;

        let request_count = rule.is_count_based().then_some(window.request_count);
        let total_weight = rule.is_weighted().then_some(window.total_weight);

        if !Self::is_limit_reached(rule, request_count, total_weight) {
            window.record(now_bucket, u64::from(weight));
            trace!(
                rule = %rule.id(),
                now,
                weight,
                request_count = window.request_count,
                total_weight = window.total_weight,
                "Call admitted"
            );
            return 0;
        }

        // Rules never have zero capacity, so a reached limit implies a retained bucket
        let oldest = window
            .buckets
            .keys()
            .next()
            .copied()
            .unwrap_or(now_bucket);
        let delay = oldest
            .saturating_add(window_span)
            .saturating_sub(now_bucket)
            .saturating_add(granularity);

        trace!(
            rule = %rule.id(),
            now,
            weight,
            delay,
            "Call over limit"
        );
        delay
    }

    /// Evaluate a single weight-1 call at the current wall-clock time.
    pub fn request_call_now(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        self.request_call(now, 1)
    }

    /// Get the state of the window as of the last evaluation.
    pub fn current_stat(&self) -> RateLimitStat {
        let window = self.window.lock();
        RateLimitStat {
            time: window.last_evaluated,
            request_count: window.request_count,
            total_weight: window.total_weight,
        }
    }

    /// Whether the given aggregates exhaust `rule`.
    ///
    /// A `None` aggregate, like a limit the rule does not define, never counts
    /// as reached.
    pub fn is_limit_reached(
        rule: &RateLimitRule,
        request_count: Option<u64>,
        total_weight: Option<u64>,
    ) -> bool {
        let count_reached = matches!(
            (rule.max_request_count(), request_count),
            (Some(max), Some(count)) if count >= max
        );
        let weight_reached = matches!(
            (rule.max_total_weight(), total_weight),
            (Some(max), Some(weight)) if weight >= max
        );
        count_reached || weight_reached
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.window.lock().buckets.len()
    }
}
