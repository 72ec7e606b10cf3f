//! Redis-backed bucket store.
//!
//! Lets every process of a cluster share bucket state. Each bucket is one
//! Redis string holding the JSON-encoded [`BucketState`], written with
//! `SET .. EX` so idle buckets expire on their own.
//!
//! ## Consistency
//!
//! - `get`/`set` are single commands on one multiplexed connection, which
//!   gives read-your-writes for a caller awaiting each call in turn.
//! - `compare_and_swap` runs a Lua script comparing the stored payload byte
//!   for byte. Encoding is deterministic and round-trips exactly
//!   (`serde_json` with `float_roundtrip`), so comparing encoded payloads is
//!   the same as comparing states.
//! - `size` walks the key space with `SCAN MATCH <prefix>*`; it is
//!   proportional to the number of keys and meant for diagnostics.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use std::time::Duration;

use super::error::{RateLimitError, Result};
use super::quota::BucketState;
use super::store::{BucketKey, RateLimitCache, DEFAULT_KEY_PREFIX, DEFAULT_TTL};

const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
    return 1
end
return 0
"#;

const SCAN_BATCH: usize = 500;

/// Configuration for the Redis bucket store
#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    /// Prefix shared by all bucket keys, used by `size`
    pub key_prefix: String,
    /// Entry lifetime after the last write
    pub ttl: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_TTL,
        }
    }
}

/// Bucket store shared through Redis
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
    config: RedisCacheConfig,
    cas: Script,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect with default configuration
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisCacheConfig::default()).await
    }

    /// Connect with a custom prefix and TTL
    pub async fn connect_with_config(url: &str, config: RedisCacheConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        tracing::info!(prefix = %config.key_prefix, "Connected rate limit cache to Redis");

        Ok(Self {
            connection,
            config,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    /// Prefix shared by the keys this cache counts in `size`
    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }

    fn ttl_secs(&self) -> u64 {
        self.config.ttl.as_secs().max(1)
    }

    fn encode(state: &BucketState) -> Result<String> {
        serde_json::to_string(state)
            .map_err(|e| RateLimitError::Cache(format!("failed to encode bucket: {}", e)))
    }

    fn decode(key: &BucketKey, raw: &str) -> Result<BucketState> {
        serde_json::from_str(raw)
            .map_err(|e| RateLimitError::Cache(format!("corrupt bucket at {}: {}", key, e)))
    }
}

#[async_trait]
impl RateLimitCache for RedisCache {
    async fn get(&self, key: &BucketKey) -> Result<Option<BucketState>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(key.as_str()).await?;
        raw.map(|raw| Self::decode(key, &raw)).transpose()
    }

    async fn set(&self, key: &BucketKey, state: BucketState) -> Result<()> {
        let mut conn = self.connection.clone();
        let payload = Self::encode(&state)?;
        let _: () = conn.set_ex(key.as_str(), payload, self.ttl_secs()).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: Option<BucketState>,
        new: BucketState,
    ) -> Result<bool> {
        let mut conn = self.connection.clone();
        let expected = match expected {
            Some(state) => Self::encode(&state)?,
            None => String::new(),
        };
        let swapped: i32 = self
            .cas
            .key(key.as_str())
            .arg(expected)
            .arg(Self::encode(&new)?)
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn size(&self) -> Result<usize> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", self.config.key_prefix);
        let mut cursor: u64 = 0;
        let mut count = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            count += keys.len();
            if next == 0 {
                return Ok(count);
            }
            cursor = next;
        }
    }
}
