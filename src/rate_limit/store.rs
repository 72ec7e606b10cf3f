//! Bucket Store
//!
//! Cache abstraction holding token bucket state, plus the process-local
//! implementation. A clustered deployment plugs in a shared backend such as
//! `RedisCache` behind the same trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use super::error::Result;
use super::quota::BucketState;

/// Default prefix for bucket keys
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit:";

/// Default entry lifetime; an idle bucket is full again after an hour anyway
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Cache key for one (user, action) bucket
///
/// The user identifier is length-prefixed, so `("a:b", "c")` and
/// `("a", "b:c")` map to different keys.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct BucketKey(String);

impl BucketKey {
    /// Build a key under the given prefix
    pub fn new(prefix: &str, user_identifier: &str, action: &str) -> Self {
        Self(format!(
            "{}{}:{}:{}",
            prefix,
            user_identifier.len(),
            user_identifier,
            action
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the companion last-update key in the two-key layout
    pub fn last_update_key(&self) -> String {
        format!("{}:last_update", self.0)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared key/value region holding bucket state
///
/// Implementations must give read-your-writes for a single caller and
/// preserve `BucketState` values exactly. Writes refresh the entry TTL.
#[async_trait]
pub trait RateLimitCache: Send + Sync + fmt::Debug {
    /// Read a bucket; `None` if absent or expired
    async fn get(&self, key: &BucketKey) -> Result<Option<BucketState>>;

    /// Unconditionally write a bucket
    async fn set(&self, key: &BucketKey, state: BucketState) -> Result<()>;

    /// Write `new` only if the stored value still equals `expected`
    ///
    /// `expected == None` means the key must be absent. Returns whether the
    /// write happened.
    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: Option<BucketState>,
        new: BucketState,
    ) -> Result<bool>;

    /// Number of live entries (diagnostic only)
    async fn size(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BucketState,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug)]
struct Entries {
    map: HashMap<BucketKey, Entry>,
    next_sweep: Instant,
}

impl Entries {
    fn new(ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            next_sweep: Instant::now() + ttl,
        }
    }

    fn live(&self, key: &BucketKey, now: Instant) -> Option<BucketState> {
        self.map
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.state)
    }

    fn purge(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_live(now));
        before - self.map.len()
    }

    /// Sweep at most once per TTL period, keeping writes amortized O(1)
    fn sweep_if_due(&mut self, now: Instant, ttl: Duration) {
        if now < self.next_sweep {
            return;
        }
        let removed = self.purge(now);
        self.next_sweep = now + ttl;
        if removed > 0 {
            debug!(removed, remaining = self.map.len(), "Swept expired rate limit buckets");
        }
    }
}

/// In-memory bucket store with TTL expiry
///
/// Expired entries are invisible to reads at once and are reclaimed by a
/// sweep that runs on a write at most once per TTL period.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<Entries>>,
    ttl: Duration,
}

impl MemoryCache {
    /// Create a store with the default TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Create a store whose entries expire `ttl` after their last write
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Entries::new(ttl))),
            ttl,
        }
    }

    /// Drop expired entries, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        self.entries.write().await.purge(Instant::now())
    }

    /// Remove every entry
    pub async fn clear(&self) {
        self.entries.write().await.map.clear();
    }

    fn entry(&self, state: BucketState, now: Instant) -> Entry {
        Entry {
            state,
            expires_at: now + self.ttl,
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitCache for MemoryCache {
    async fn get(&self, key: &BucketKey) -> Result<Option<BucketState>> {
        Ok(self.entries.read().await.live(key, Instant::now()))
    }

    async fn set(&self, key: &BucketKey, state: BucketState) -> Result<()> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.sweep_if_due(now, self.ttl);
        entries.map.insert(key.clone(), self.entry(state, now));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: Option<BucketState>,
        new: BucketState,
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        if entries.live(key, now) != expected {
            return Ok(false);
        }

        entries.sweep_if_due(now, self.ttl);
        entries.map.insert(key.clone(), self.entry(new, now));
        Ok(true)
    }

    async fn size(&self) -> Result<usize> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries.map.values().filter(|entry| entry.is_live(now)).count())
    }
}
