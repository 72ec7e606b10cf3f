//! Admission Gate
//!
//! Entry point for calling code: decides whether a user's action may proceed.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::config::{CacheBackend, FailurePolicy, RateLimitConfig};
use super::error::Result;
use super::ledger::{RateLimitResult, TokenBucketLedger};
use super::policy::PolicyStore;
use super::store::{MemoryCache, RateLimitCache};
use super::subject::RateLimitSubject;
use crate::metrics::{self, outcome};

/// Admission gate combining policy lookup and bucket accounting
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    /// Configuration
    config: Arc<RwLock<RateLimitConfig>>,

    /// Action and tier policy
    policy: PolicyStore,

    /// Bucket accounting
    ledger: TokenBucketLedger,
}

impl AdmissionGate {
    /// Assemble a gate from already built parts
    pub fn new(config: RateLimitConfig, policy: PolicyStore, ledger: TokenBucketLedger) -> Self {
        metrics::init();
        Self {
            config: Arc::new(RwLock::new(config)),
            policy,
            ledger,
        }
    }

    /// Build the cache, ledger and policy described by `config`
    ///
    /// Uses the system clock. Fails if the configuration is invalid, the
    /// policy cannot be read or parsed, or the cache cannot be reached.
    pub async fn from_config(config: RateLimitConfig) -> anyhow::Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock::new())).await
    }

    /// Same as [`AdmissionGate::from_config`] with an explicit clock
    pub async fn from_config_with_clock(
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        config.validate()?;

        let policy_json = config.policy_document()?;
        let policy = PolicyStore::from_json(&policy_json, config.capacity_tiers.clone())
            .context("Failed to load rate limit policy")?;

        let cache = Self::build_cache(&config).await?;
        let ledger = TokenBucketLedger::new(cache, clock)
            .with_key_prefix(config.cache.key_prefix.clone())
            .with_consistency(config.consistency)
            .with_max_cas_attempts(config.max_cas_attempts);

        Ok(Self::new(config, policy, ledger))
    }

    async fn build_cache(config: &RateLimitConfig) -> anyhow::Result<Arc<dyn RateLimitCache>> {
        match config.cache.backend {
            CacheBackend::Memory => Ok(Arc::new(MemoryCache::with_ttl(config.cache.ttl()))),
            #[cfg(feature = "redis-cache")]
            CacheBackend::Redis => {
                use super::redis_store::{RedisCache, RedisCacheConfig};

                let url = config
                    .cache
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("Redis cache backend requires redis_url"))?;
                let cache = RedisCache::connect_with_config(
                    url,
                    RedisCacheConfig {
                        key_prefix: config.cache.key_prefix.clone(),
                        ttl: config.cache.ttl(),
                    },
                )
                .await?;
                Ok(Arc::new(cache))
            }
            #[cfg(not(feature = "redis-cache"))]
            CacheBackend::Redis => {
                anyhow::bail!("Redis cache backend requires the `redis-cache` feature")
            }
        }
    }

    /// Check and consume quota for `action` on behalf of `user`
    ///
    /// Cache failures are returned to the caller; see [`AdmissionGate::is_allowed`]
    /// for a variant that applies the configured failure policy.
    pub async fn check_rate<S>(&self, user: &S, action: &str) -> Result<bool>
    where
        S: RateLimitSubject + ?Sized,
    {
        Ok(self.check(user, action).await?.allowed)
    }

    /// Like [`AdmissionGate::check_rate`], with remaining tokens and retry hint
    pub async fn check<S>(&self, user: &S, action: &str) -> Result<RateLimitResult>
    where
        S: RateLimitSubject + ?Sized,
    {
        let (enabled, guest_tier) = {
            let config = self.config.read().await;
            (config.enabled, config.guest_tier)
        };

        if !enabled {
            metrics::record_check(outcome::UNLIMITED);
            return Ok(RateLimitResult::unlimited());
        }

        if user.is_superuser() {
            debug!(user = user.identifier(), action, "Superuser bypasses rate limit");
            metrics::record_check(outcome::BYPASSED);
            return Ok(RateLimitResult::unlimited());
        }

        let tier = user.rate_limit_tier().unwrap_or(guest_tier);
        let capacity = self.policy.effective_limit(action, tier);
        if capacity.is_unlimited() {
            metrics::record_check(outcome::UNLIMITED);
            return Ok(RateLimitResult::unlimited());
        }

        match self.ledger.consume(user.identifier(), action, capacity).await {
            Ok(result) => {
                if result.allowed {
                    metrics::record_check(outcome::ALLOWED);
                } else {
                    debug!(
                        user = user.identifier(),
                        action,
                        tier,
                        %capacity,
                        "Rate limit exceeded"
                    );
                    metrics::record_check(outcome::DENIED);
                }
                Ok(result)
            }
            Err(e) => {
                metrics::record_check(outcome::ERROR);
                Err(e)
            }
        }
    }

    /// Check quota, resolving cache failures with the configured policy
    pub async fn is_allowed<S>(&self, user: &S, action: &str) -> bool
    where
        S: RateLimitSubject + ?Sized,
    {
        match self.check_rate(user, action).await {
            Ok(allowed) => allowed,
            Err(e) => {
                let failure_policy = self.config.read().await.failure_policy;
                let allowed = failure_policy == FailurePolicy::Open;
                warn!(
                    user = user.identifier(),
                    action,
                    allowed,
                    "Rate limit check failed: {}",
                    e
                );
                allowed
            }
        }
    }

    /// Replace the policy document, keeping tier capacities
    pub fn reload_policy(&self, policy_json: &str) -> Result<()> {
        self.policy.reload(policy_json)
    }

    /// Update configuration
    ///
    /// Tier capacities are republished to the policy store. Cache backend,
    /// key prefix and consistency mode are fixed when the gate is built.
    pub async fn update_config(&self, config: RateLimitConfig) -> Result<()> {
        self.policy.set_tier_overrides(config.capacity_tiers.clone())?;
        let mut current = self.config.write().await;
        *current = config;
        Ok(())
    }

    /// Get current configuration
    pub async fn get_config(&self) -> RateLimitConfig {
        self.config.read().await.clone()
    }

    /// Policy store (for admin reloads)
    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    /// Bucket ledger (for diagnostics)
    pub fn ledger(&self) -> &TokenBucketLedger {
        &self.ledger
    }
}
