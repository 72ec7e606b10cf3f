//! Rate Limiting Module
//!
//! Per-user, per-action token buckets with tiered hourly quotas, kept in a
//! cache that may be shared by every process of a cluster.
//!
//! # Features
//!
//! - Lazy token bucket refill; no timers per bucket
//! - Tier and action policy, reloadable at runtime by snapshot swap
//! - Pluggable bucket cache (in-memory, Redis)
//! - Relaxed or compare-and-swap bucket updates
//! - Superuser and unlimited-tier bypass
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Admission Gate                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐          ┌─────────────────────────┐  │
//! │  │   Policy Store   │          │   Token Bucket Ledger   │  │
//! │  │ (action, tier)→N │          │  refill / consume / CAS │  │
//! │  └──────────────────┘          └─────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │        Bucket Cache (in-memory or Redis, TTL)        │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod policy;
pub mod quota;
#[cfg(feature = "redis-cache")]
pub mod redis_store;
pub mod store;
pub mod subject;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{CacheBackend, CacheConfig, Consistency, FailurePolicy, RateLimitConfig};
pub use error::RateLimitError;
pub use ledger::{RateLimitResult, TokenBucketLedger};
pub use manager::AdmissionGate;
pub use policy::{parse_capacity_tiers, ActionPolicy, PolicyDocument, PolicySnapshot, PolicyStore};
pub use quota::{BucketState, Capacity, NO_LIMIT};
#[cfg(feature = "redis-cache")]
pub use redis_store::{RedisCache, RedisCacheConfig};
pub use store::{BucketKey, MemoryCache, RateLimitCache};
pub use subject::{RateLimitSubject, User, GUEST_IDENTIFIER};
