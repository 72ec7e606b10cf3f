//! Token Bucket Ledger
//!
//! Applies the lazy token bucket to state held in a [`RateLimitCache`].
//! Refill happens at access time from the stored timestamp, so no timers run
//! per bucket and any node of a cluster can serve any check.
//!
//! Every limited check writes back, including denials: the refill computed
//! for a denied request is persisted along with the new timestamp, so a run
//! of rejected requests does not leave an old timestamp behind that would
//! over-credit the next check.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::clock::Clock;
use super::config::{Consistency, DEFAULT_MAX_CAS_ATTEMPTS};
use super::error::{RateLimitError, Result};
use super::quota::{BucketState, Capacity};
use super::store::{BucketKey, RateLimitCache, DEFAULT_KEY_PREFIX};
use crate::metrics;

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,

    /// Whole tokens left after this request
    pub remaining: u32,

    /// Time until a token is available (if not allowed)
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    /// Create an allowed result
    pub fn allowed(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: None,
        }
    }

    /// Create a denied result
    pub fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after: Some(retry_after),
        }
    }

    /// Result for checks that bypass accounting
    pub fn unlimited() -> Self {
        Self::allowed(u32::MAX)
    }
}

/// Token bucket accounting over a shared cache
#[derive(Debug, Clone)]
pub struct TokenBucketLedger {
    cache: Arc<dyn RateLimitCache>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    consistency: Consistency,
    max_cas_attempts: u32,
}

impl TokenBucketLedger {
    /// Create a relaxed ledger with the default key prefix
    pub fn new(cache: Arc<dyn RateLimitCache>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            clock,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            consistency: Consistency::Relaxed,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    /// Cache key for a (user, action) pair
    pub fn key(&self, user_identifier: &str, action: &str) -> BucketKey {
        BucketKey::new(&self.key_prefix, user_identifier, action)
    }

    /// Consume one token if available
    pub async fn try_consume(
        &self,
        user_identifier: &str,
        action: &str,
        capacity: Capacity,
    ) -> Result<bool> {
        Ok(self.consume(user_identifier, action, capacity).await?.allowed)
    }

    /// Consume one token if available, reporting what is left
    pub async fn consume(
        &self,
        user_identifier: &str,
        action: &str,
        capacity: Capacity,
    ) -> Result<RateLimitResult> {
        let capacity_per_hour = match capacity {
            Capacity::Unlimited => return Ok(RateLimitResult::unlimited()),
            Capacity::PerHour(n) => n,
        };

        let key = self.key(user_identifier, action);
        let result = match self.consistency {
            Consistency::Relaxed => self.consume_relaxed(&key, capacity_per_hour).await?,
            Consistency::Strict => self.consume_strict(&key, capacity_per_hour).await?,
        };

        trace!(key = %key, allowed = result.allowed, remaining = result.remaining, "Bucket checked");
        Ok(result)
    }

    /// Current replenished state without consuming or writing
    ///
    /// Returns `None` for unlimited capacity.
    pub async fn peek(
        &self,
        user_identifier: &str,
        action: &str,
        capacity: Capacity,
    ) -> Result<Option<BucketState>> {
        let capacity_per_hour = match capacity {
            Capacity::Unlimited => return Ok(None),
            Capacity::PerHour(n) => n,
        };

        let key = self.key(user_identifier, action);
        let now = self.clock.now_millis();
        let stored = self.cache.get(&key).await?;
        Ok(Some(Self::current(stored, capacity_per_hour, now)))
    }

    async fn consume_relaxed(&self, key: &BucketKey, capacity_per_hour: u32) -> Result<RateLimitResult> {
        let now = self.clock.now_millis();
        let stored = self.cache.get(key).await?;
        let (next, result) = Self::step(stored, capacity_per_hour, now);
        self.cache.set(key, next).await?;
        Ok(result)
    }

    async fn consume_strict(&self, key: &BucketKey, capacity_per_hour: u32) -> Result<RateLimitResult> {
        for attempt in 1..=self.max_cas_attempts {
            let now = self.clock.now_millis();
            let stored = self.cache.get(key).await?;
            let (next, result) = Self::step(stored, capacity_per_hour, now);

            if self.cache.compare_and_swap(key, stored, next).await? {
                return Ok(result);
            }

            metrics::CAS_RETRIES_TOTAL.inc();
            debug!(key = %key, attempt, "Bucket changed underneath update, retrying");
        }

        Err(RateLimitError::Contention {
            key: key.to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    fn current(stored: Option<BucketState>, capacity_per_hour: u32, now: i64) -> BucketState {
        stored
            .unwrap_or_else(|| BucketState::full(capacity_per_hour, now))
            .replenished(capacity_per_hour, now)
    }

    /// One bucket transition: refill, then take a token if there is one
    fn step(
        stored: Option<BucketState>,
        capacity_per_hour: u32,
        now: i64,
    ) -> (BucketState, RateLimitResult) {
        let refilled = Self::current(stored, capacity_per_hour, now);

        if refilled.has_token() {
            let next = refilled.consumed();
            (next, RateLimitResult::allowed(next.tokens.floor() as u32))
        } else {
            let retry_after = refilled.retry_after(capacity_per_hour);
            (refilled, RateLimitResult::denied(retry_after))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::MockClock;
    use crate::rate_limit::store::MemoryCache;
    use async_trait::async_trait;

    fn ledger() -> (TokenBucketLedger, MemoryCache, MockClock) {
        let cache = MemoryCache::new();
        let clock = MockClock::new(1_700_000_000_000);
        let ledger = TokenBucketLedger::new(Arc::new(cache.clone()), Arc::new(clock.clone()));
        (ledger, cache, clock)
    }

    async fn admitted_in_a_row(ledger: &TokenBucketLedger, user: &str, action: &str, cap: u32) -> u32 {
        let mut count = 0;
        while ledger
            .try_consume(user, action, Capacity::PerHour(cap))
            .await
            .unwrap()
        {
            count += 1;
            assert!(count <= cap, "admitted more than capacity");
        }
        count
    }

    #[tokio::test]
    async fn test_unlimited_never_touches_cache() {
        let (ledger, cache, _) = ledger();
        for _ in 0..500 {
            assert!(ledger.try_consume("u", "a", Capacity::Unlimited).await.unwrap());
        }
        assert_eq!(cache.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exactly_capacity_then_denied() {
        let (ledger, _, _) = ledger();
        assert_eq!(admitted_in_a_row(&ledger, "u", "a", 30).await, 30);
        assert!(!ledger.try_consume("u", "a", Capacity::PerHour(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_capacity_denies() {
        let (ledger, _, _) = ledger();
        assert!(!ledger.try_consume("u", "a", Capacity::PerHour(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_replenish_after_interval() {
        let (ledger, _, clock) = ledger();
        let cap = Capacity::PerHour(120);
        assert_eq!(admitted_in_a_row(&ledger, "u", "a", 120).await, 120);

        clock.advance(Duration::from_secs(29));
        assert!(!ledger.peek("u", "a", cap).await.unwrap().unwrap().has_token());

        clock.advance(Duration::from_secs(1));
        assert!(ledger.try_consume("u", "a", cap).await.unwrap());
        assert!(!ledger.try_consume("u", "a", cap).await.unwrap());
    }

    #[tokio::test]
    async fn test_denial_persists_elapsed_time() {
        let (ledger, cache, clock) = ledger();
        let cap = Capacity::PerHour(120);
        admitted_in_a_row(&ledger, "u", "a", 120).await;

        clock.advance(Duration::from_secs(15));
        assert!(!ledger.try_consume("u", "a", cap).await.unwrap());

        let stored = cache.get(&ledger.key("u", "a")).await.unwrap().unwrap();
        assert_eq!(stored.tokens, 0.5);
        assert_eq!(stored.last_update_millis, clock.now_millis());

        clock.advance(Duration::from_secs(15));
        assert!(ledger.try_consume("u", "a", cap).await.unwrap());
    }

    #[tokio::test]
    async fn test_buckets_are_per_user_and_action() {
        let (ledger, cache, _) = ledger();
        assert_eq!(admitted_in_a_row(&ledger, "u1", "a", 3).await, 3);
        assert_eq!(admitted_in_a_row(&ledger, "u2", "a", 3).await, 3);
        assert_eq!(admitted_in_a_row(&ledger, "u1", "b", 3).await, 3);
        assert_eq!(cache.size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_consume_reports_remaining_and_retry_after() {
        let (ledger, _, _) = ledger();
        let cap = Capacity::PerHour(2);

        let first = ledger.consume("u", "a", cap).await.unwrap();
        assert_eq!(first, RateLimitResult::allowed(1));

        ledger.consume("u", "a", cap).await.unwrap();
        let denied = ledger.consume("u", "a", cap).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1800)));
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (ledger, cache, _) = ledger();
        let cap = Capacity::PerHour(10);

        let state = ledger.peek("u", "a", cap).await.unwrap().unwrap();
        assert_eq!(state.tokens, 10.0);
        assert_eq!(cache.size().await.unwrap(), 0);
        assert_eq!(ledger.peek("u", "a", Capacity::Unlimited).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_strict_mode_never_over_admits() {
        let cache = MemoryCache::new();
        let clock = MockClock::new(0);
        let ledger = TokenBucketLedger::new(Arc::new(cache), Arc::new(clock))
            .with_consistency(Consistency::Strict)
            .with_max_cas_attempts(1_000);

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .try_consume("u", "a", Capacity::PerHour(20))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 20);
    }

    /// Cache whose compare-and-swap always loses
    #[derive(Debug, Default)]
    struct AlwaysContended(MemoryCache);

    #[async_trait]
    impl RateLimitCache for AlwaysContended {
        async fn get(&self, key: &BucketKey) -> Result<Option<BucketState>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &BucketKey, state: BucketState) -> Result<()> {
            self.0.set(key, state).await
        }
        async fn compare_and_swap(&self, _: &BucketKey, _: Option<BucketState>, _: BucketState) -> Result<bool> {
            Ok(false)
        }
        async fn size(&self) -> Result<usize> {
            self.0.size().await
        }
    }

    #[tokio::test]
    async fn test_strict_mode_reports_contention() {
        let ledger = TokenBucketLedger::new(Arc::new(AlwaysContended::default()), Arc::new(MockClock::new(0)))
            .with_consistency(Consistency::Strict)
            .with_max_cas_attempts(3);

        let err = ledger
            .try_consume("u", "a", Capacity::PerHour(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Contention { attempts: 3, .. }));
    }

    /// Cache that is always unreachable
    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl RateLimitCache for Unreachable {
        async fn get(&self, _: &BucketKey) -> Result<Option<BucketState>> {
            Err(RateLimitError::Cache("connection refused".to_string()))
        }
        async fn set(&self, _: &BucketKey, _: BucketState) -> Result<()> {
            Err(RateLimitError::Cache("connection refused".to_string()))
        }
        async fn compare_and_swap(&self, _: &BucketKey, _: Option<BucketState>, _: BucketState) -> Result<bool> {
            Err(RateLimitError::Cache("connection refused".to_string()))
        }
        async fn size(&self) -> Result<usize> {
            Err(RateLimitError::Cache("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let ledger = TokenBucketLedger::new(Arc::new(Unreachable), Arc::new(MockClock::new(0)));
        let err = ledger
            .try_consume("u", "a", Capacity::PerHour(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Cache(_)));

        // Unlimited capacity never reaches the backend
        assert!(ledger.try_consume("u", "a", Capacity::Unlimited).await.unwrap());
    }
}
