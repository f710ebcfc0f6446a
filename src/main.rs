use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use futures::future::join_all;
use tokio::signal;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use request_throttler::config::ThrottlerConfig;
use request_throttler::ratelimit::{RateLimitRule, RateLimitRules};
use request_throttler::throttler::{RequestThrottler, Response, RestRequest, ThrottlingMode};

/// Replay a burst of requests through a throttler and report when each one completes.
#[derive(Parser, Debug)]
#[command(name = "request-throttler", version, about)]
struct Cli {
    /// Rate limit rules file (YAML or JSON)
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Throttler configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Throttling mode: throttle, block or none
    #[arg(short, long)]
    mode: Option<ThrottlingMode>,

    /// Longest delay accepted in throttle mode, in milliseconds
    #[arg(long)]
    max_throttle_delay_ms: Option<u64>,

    /// Number of requests to submit
    #[arg(short = 'n', long, default_value_t = 10)]
    requests: usize,

    /// Weight of every request
    #[arg(short, long, default_value_t = 1)]
    weight: u32,

    /// Rule ids every request counts against; all loaded rules when omitted
    #[arg(long, value_delimiter = ',')]
    rules_for_request: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ThrottlerConfig::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.throttling_mode = mode;
    }
    if cli.max_throttle_delay_ms.is_some() {
        config.max_throttle_delay_ms = cli.max_throttle_delay_ms;
    }

    let rules_path = match (&cli.rules, &config.rules_path) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => PathBuf::from(path),
        (None, None) => bail!("no rate limit rules given; pass --rules or set rules_path"),
    };
    let rules = RateLimitRules::from_file(&rules_path)
        .and_then(|rules| rules.build())
        .with_context(|| format!("loading rules from {}", rules_path.display()))?;

    let request_rules: Vec<Arc<RateLimitRule>> = if cli.rules_for_request.is_empty() {
        rules.values().cloned().collect()
    } else {
        cli.rules_for_request
            .iter()
            .map(|id| {
                rules
                    .get(id)
                    .cloned()
                    .with_context(|| format!("unknown rate limit rule `{}`", id))
            })
            .collect::<anyhow::Result<_>>()?
    };

    info!(
        api = %config.api_name,
        mode = %config.throttling_mode,
        max_throttle_delay_ms = ?config.max_throttle_delay_ms,
        rules = request_rules.len(),
        "Configuration loaded"
    );

    let throttler = RequestThrottler::from_config(&config);
    let start = Instant::now();

    let mut pending = Vec::with_capacity(cli.requests);
    for index in 0..cli.requests {
        let request = RestRequest::new(format!("/replay/{}", index))
            .with_rate_limits(request_rules.iter().cloned())
            .with_weight(cli.weight);
        let response = throttler.submit(request, |request: RestRequest| async move {
            Response::ok(request.endpoint().to_string())
        })?;

        pending.push(tokio::spawn(async move {
            let response = response.await;
            let elapsed_ms = millis(start.elapsed());
            match response.rate_limit_reached() {
                Some(reached) => warn!(
                    request = index,
                    elapsed_ms,
                    status = response.status_code(),
                    required_delay_ms = millis(reached.required_delay()),
                    "Request rejected"
                ),
                None => info!(
                    request = index,
                    elapsed_ms,
                    status = response.status_code(),
                    "Request completed"
                ),
            }
        }));
    }

    // Run until every request finished or a shutdown signal arrives
    tokio::select! {
        _ = join_all(pending) => {
            info!(elapsed_ms = millis(start.elapsed()), "All requests completed");
            throttler.dispose();
        }
        result = dispose_on_signal(&throttler) => result?,
    }

    Ok(())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Dispose `throttler` once Ctrl+C or SIGTERM arrives, cancelling every
/// request still waiting for its turn.
async fn dispose_on_signal(throttler: &RequestThrottler) -> anyhow::Result<()> {
    let received = tokio::select! {
        result = signal::ctrl_c() => {
            result.context("listening for Ctrl+C")?;
            "ctrl_c"
        }
        result = terminated() => {
            result?;
            "sigterm"
        }
    };

    warn!(
        signal = received,
        api = %throttler.api_name(),
        "Shutdown requested, cancelling pending requests"
    );
    throttler.dispose();
    Ok(())
}

#[cfg(unix)]
async fn terminated() -> anyhow::Result<()> {
    signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?
        .recv()
        .await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminated() -> anyhow::Result<()> {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_for_request_splits_ids() {
        let cli = Cli::try_parse_from([
            "request-throttler",
            "--rules",
            "rules.yaml",
            "--rules-for-request",
            "per_second,per_minute",
        ])
        .unwrap();
        assert_eq!(cli.rules_for_request, vec!["per_second", "per_minute"]);
    }

    #[test]
    fn test_rules_for_request_defaults_to_all_rules() {
        let cli = Cli::try_parse_from(["request-throttler"]).unwrap();
        assert!(cli.rules_for_request.is_empty());
        assert_eq!(cli.requests, 10);
    }

    #[test]
    fn test_old_rule_flag_is_rejected() {
        assert!(Cli::try_parse_from(["request-throttler", "--rule", "a"]).is_err());
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(42)), 42);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
