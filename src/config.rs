// Configuration File Support
//
// TOML configuration for hosts embedding the rate limiter, with environment
// variable overrides. Missing files fall back to defaults so a host can run
// with nothing but environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::rate_limit::RateLimitConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. If the file does not exist, returns defaults with
    /// environment overrides applied.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            let config = Self::default().apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        let config = config.apply_env_overrides();
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - TIERLIMIT_LOG_LEVEL
    /// - TIERLIMIT_LOG_FORMAT
    /// - plus the rate limit variables of [`RateLimitConfig::apply_env_overrides`]
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("TIERLIMIT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TIERLIMIT_LOG_FORMAT") {
            self.logging.format = format;
        }

        self.rate_limit = self.rate_limit.apply_env_overrides();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.rate_limit.validate()
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{Consistency, FailurePolicy, NO_LIMIT};
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Tests touching process environment must not interleave
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "TIERLIMIT_LOG_LEVEL",
        "TIERLIMIT_LOG_FORMAT",
        "TIERLIMIT_ENABLED",
        "TIERLIMIT_GUEST_TIER",
        "TIERLIMIT_CAPACITY_TIERS",
        "TIERLIMIT_POLICY_PATH",
        "TIERLIMIT_CONSISTENCY",
        "TIERLIMIT_FAILURE_POLICY",
        "TIERLIMIT_REDIS_URL",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "compact");
        assert!(config.rate_limit.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_checks_rate_limit() {
        let mut config = Config::default();
        config.rate_limit.capacity_tiers = vec![10, -9];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("nonexistent");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[rate_limit]
guest_tier = 0
capacity_tiers = [30, 60, 120, -1]
consistency = "strict"
failure_policy = "closed"
policy_json = '{"rateLimits":[{"tier":1,"limitPerHour":30,"actions":["GetDatasetCommand"]}]}'

[rate_limit.cache]
key_prefix = "dv:rl:"
ttl_secs = 7200
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.rate_limit.capacity_tiers, vec![30, 60, 120, NO_LIMIT]);
        assert_eq!(config.rate_limit.consistency, Consistency::Strict);
        assert_eq!(config.rate_limit.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.rate_limit.cache.key_prefix, "dv:rl:");
        assert_eq!(config.rate_limit.cache.ttl_secs, 7200);
        assert!(config.rate_limit.policy_document().unwrap().contains("GetDatasetCommand"));
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging
level = "debug"
"#;

        fs::write(temp_file.path(), toml_content).unwrap();

        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(
            temp_file.path(),
            "[rate_limit]\ncapacity_tiers = [30, -2]\n",
        )
        .unwrap();

        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var("TIERLIMIT_LOG_LEVEL", "debug");
        std::env::set_var("TIERLIMIT_LOG_FORMAT", "json");
        std::env::set_var("TIERLIMIT_GUEST_TIER", "2");
        std::env::set_var("TIERLIMIT_CAPACITY_TIERS", "30,60,120,-1");
        std::env::set_var("TIERLIMIT_CONSISTENCY", "strict");
        std::env::set_var("TIERLIMIT_FAILURE_POLICY", "closed");

        let config = Config::default().apply_env_overrides();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.rate_limit.guest_tier, 2);
        assert_eq!(config.rate_limit.capacity_tiers, vec![30, 60, 120, NO_LIMIT]);
        assert_eq!(config.rate_limit.consistency, Consistency::Strict);
        assert_eq!(config.rate_limit.failure_policy, FailurePolicy::Closed);

        clear_env();
    }

    #[test]
    fn test_env_overrides_invalid_values() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var("TIERLIMIT_CAPACITY_TIERS", "30,abc");
        std::env::set_var("TIERLIMIT_GUEST_TIER", "-1");
        std::env::set_var("TIERLIMIT_CONSISTENCY", "eventual");

        let config = Config::default().apply_env_overrides();

        // Should keep defaults for invalid values
        assert!(config.rate_limit.capacity_tiers.is_empty());
        assert_eq!(config.rate_limit.guest_tier, 0);
        assert_eq!(config.rate_limit.consistency, Consistency::Relaxed);

        clear_env();
    }

    #[test]
    fn test_redis_url_env_selects_backend() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        std::env::set_var("TIERLIMIT_REDIS_URL", "redis://127.0.0.1/");
        let config = Config::default().apply_env_overrides();
        assert_eq!(
            config.rate_limit.cache.backend,
            crate::rate_limit::CacheBackend::Redis
        );
        assert!(config.validate().is_ok());

        clear_env();
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = Config::default();
        config.logging.level = "debug".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);

        config.logging.level = "invalid".to_string();
        assert!(config.log_level().is_err());
    }

    #[test]
    fn test_config_partial_toml() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();

        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[logging]\nlevel = \"debug\"\n").unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.rate_limit, RateLimitConfig::default());
    }
}
