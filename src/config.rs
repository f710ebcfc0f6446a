//! Configuration management for the request throttler.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, ThrottlerError};
use crate::throttler::{ThrottlingMode, DEFAULT_API_NAME};

/// Prefix of environment variables overriding file settings.
pub const ENV_PREFIX: &str = "THROTTLER";

/// Settings of one [`RequestThrottler`](crate::throttler::RequestThrottler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// Diagnostic name of the API
    #[serde(default = "default_api_name")]
    pub api_name: String,

    /// Policy for calls that exceed a rate limit
    #[serde(default)]
    pub throttling_mode: ThrottlingMode,

    /// Longest delay accepted in throttle mode; unlimited when absent
    #[serde(default)]
    pub max_throttle_delay_ms: Option<u64>,

    /// Path to the rate limit rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            api_name: default_api_name(),
            throttling_mode: ThrottlingMode::default(),
            max_throttle_delay_ms: None,
            rules_path: None,
        }
    }
}

fn default_api_name() -> String {
    DEFAULT_API_NAME.to_string()
}

impl ThrottlerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ThrottlerConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ThrottlerError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply `THROTTLER_*`
    /// environment overrides (e.g. `THROTTLER_THROTTLING_MODE=block`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// The delay cap as a [`Duration`].
    pub fn max_throttle_delay(&self) -> Option<Duration> {
        self.max_throttle_delay_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = ThrottlerConfig::default();
        assert_eq!(config.api_name, DEFAULT_API_NAME);
        assert_eq!(config.throttling_mode, ThrottlingMode::Throttle);
        assert_eq!(config.max_throttle_delay(), None);
    }

    #[test]
    fn test_from_file() {
        let path = write_temp(
            "throttler.yaml",
            "api_name: spot\nthrottling_mode: block\nmax_throttle_delay_ms: 1500\n",
        );
        let config = ThrottlerConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.api_name, "spot");
        assert_eq!(config.throttling_mode, ThrottlingMode::Block);
        assert_eq!(config.max_throttle_delay(), Some(Duration::from_millis(1500)));
        assert_eq!(config.rules_path, None);
    }

    #[test]
    fn test_from_file_partial_uses_defaults() {
        let path = write_temp("partial.yaml", "rules_path: rules.yaml\n");
        let config = ThrottlerConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.api_name, DEFAULT_API_NAME);
        assert_eq!(config.throttling_mode, ThrottlingMode::Throttle);
        assert_eq!(config.rules_path.as_deref(), Some("rules.yaml"));
    }

    #[test]
    fn test_from_file_rejects_unknown_mode() {
        let path = write_temp("bad-mode.yaml", "throttling_mode: sometimes\n");
        let result = ThrottlerConfig::from_file(path.to_str().unwrap());
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(ThrottlerError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ThrottlerConfig::from_file("/nonexistent/throttler.yaml"),
            Err(ThrottlerError::Io(_))
        ));
    }

    #[test]
    fn test_load_layers_file() {
        let path = write_temp("layered.yaml", "api_name: futures\nmax_throttle_delay_ms: 200\n");
        let config = ThrottlerConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.api_name, "futures");
        assert_eq!(config.max_throttle_delay_ms, Some(200));
    }
}
