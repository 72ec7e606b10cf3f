//! Tierlimit
//!
//! Tiered token bucket rate limiting for per-user actions, with bucket state
//! kept in a cache that can be shared across a cluster.
//!
//! ```no_run
//! use tierlimit::rate_limit::{AdmissionGate, RateLimitConfig, User};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = RateLimitConfig {
//!     capacity_tiers: vec![30, 60, 120, -1],
//!     ..RateLimitConfig::default()
//! };
//! let gate = AdmissionGate::from_config(config).await?;
//!
//! let user = User::authenticated("alice", 1);
//! if !gate.is_allowed(&user, "PublishDatasetCommand").await {
//!     // reject the command
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
