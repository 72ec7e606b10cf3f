//! Rate Limit Configuration
//!
//! Deployment settings for tiers, policy source, cache backend and failure
//! handling.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use super::policy::parse_capacity_tiers;
use super::quota::NO_LIMIT;
use super::store::DEFAULT_KEY_PREFIX;

/// Tier assigned to guests unless configured otherwise
pub const DEFAULT_GUEST_TIER: u32 = 0;

/// Compare-and-swap attempts before a strict update gives up
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 16;

/// Policy document used when none is configured
pub const EMPTY_POLICY: &str = r#"{"rateLimits":[]}"#;

/// How bucket read-modify-write is performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// Plain get + set; concurrent racers may both be admitted
    #[default]
    Relaxed,
    /// Compare-and-swap loop; never admits more than the bucket holds
    Strict,
}

/// What `is_allowed` answers when the cache backend fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// Which cache implementation backs the buckets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process-local map
    #[default]
    Memory,
    /// Shared Redis instance (feature `redis-cache`)
    Redis,
}

/// Bucket cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend kind
    pub backend: CacheBackend,

    /// Redis URL (required for the redis backend)
    pub redis_url: Option<String>,

    /// Prefix for bucket keys
    pub key_prefix: String,

    /// Seconds an idle bucket is kept
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    /// Entry lifetime
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Tier used for guests
    pub guest_tier: u32,

    /// Hourly capacity per tier, indexed by tier; `-1` means unlimited
    pub capacity_tiers: Vec<i64>,

    /// Inline policy document (takes precedence over `policy_path`)
    pub policy_json: Option<String>,

    /// Path to a policy document
    pub policy_path: Option<String>,

    /// Bucket update mode
    pub consistency: Consistency,

    /// Answer on cache failure
    pub failure_policy: FailurePolicy,

    /// Attempts before a strict update reports contention
    pub max_cas_attempts: u32,

    /// Bucket cache
    pub cache: CacheConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            guest_tier: DEFAULT_GUEST_TIER,
            capacity_tiers: Vec::new(),
            policy_json: None,
            policy_path: None,
            consistency: Consistency::Relaxed,
            failure_policy: FailurePolicy::Open,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
            cache: CacheConfig::default(),
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().apply_env_overrides()
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Apply environment variable overrides
    ///
    /// - TIERLIMIT_ENABLED
    /// - TIERLIMIT_GUEST_TIER
    /// - TIERLIMIT_CAPACITY_TIERS (comma separated, e.g. "30,60,120,-1")
    /// - TIERLIMIT_POLICY_PATH
    /// - TIERLIMIT_CONSISTENCY (relaxed, strict)
    /// - TIERLIMIT_FAILURE_POLICY (open, closed)
    /// - TIERLIMIT_REDIS_URL (also selects the redis backend)
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("TIERLIMIT_ENABLED") {
            self.enabled = val.parse().unwrap_or(self.enabled);
        }

        if let Ok(val) = std::env::var("TIERLIMIT_GUEST_TIER") {
            if let Ok(tier) = val.parse() {
                self.guest_tier = tier;
            }
        }

        if let Ok(val) = std::env::var("TIERLIMIT_CAPACITY_TIERS") {
            match parse_capacity_tiers(&val) {
                Ok(tiers) => self.capacity_tiers = tiers,
                Err(e) => tracing::warn!("Ignoring TIERLIMIT_CAPACITY_TIERS: {}", e),
            }
        }

        if let Ok(path) = std::env::var("TIERLIMIT_POLICY_PATH") {
            self.policy_path = Some(path);
        }

        if let Ok(val) = std::env::var("TIERLIMIT_CONSISTENCY") {
            match val.to_lowercase().as_str() {
                "relaxed" => self.consistency = Consistency::Relaxed,
                "strict" => self.consistency = Consistency::Strict,
                other => tracing::warn!("Ignoring TIERLIMIT_CONSISTENCY={}", other),
            }
        }

        if let Ok(val) = std::env::var("TIERLIMIT_FAILURE_POLICY") {
            match val.to_lowercase().as_str() {
                "open" => self.failure_policy = FailurePolicy::Open,
                "closed" => self.failure_policy = FailurePolicy::Closed,
                other => tracing::warn!("Ignoring TIERLIMIT_FAILURE_POLICY={}", other),
            }
        }

        if let Ok(url) = std::env::var("TIERLIMIT_REDIS_URL") {
            self.cache.backend = CacheBackend::Redis;
            self.cache.redis_url = Some(url);
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some((tier, value)) = self
            .capacity_tiers
            .iter()
            .enumerate()
            .find(|(_, v)| **v < 0 && **v != NO_LIMIT)
        {
            anyhow::bail!("Tier {} capacity {} is invalid; use -1 for no limit", tier, value);
        }

        if self.max_cas_attempts == 0 {
            anyhow::bail!("max_cas_attempts must be > 0");
        }

        if self.cache.ttl_secs == 0 {
            anyhow::bail!("Cache TTL must be > 0 seconds");
        }

        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
            anyhow::bail!("Redis cache backend selected but no redis_url configured");
        }

        Ok(())
    }

    /// Policy document text from inline JSON, file, or the empty default
    pub fn policy_document(&self) -> Result<String> {
        if let Some(json) = &self.policy_json {
            return Ok(json.clone());
        }

        match &self.policy_path {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("Failed to read rate limit policy from {:?}", path)),
            None => Ok(EMPTY_POLICY.to_string()),
        }
    }
}
