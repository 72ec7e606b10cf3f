//! Quota Types and Token Bucket Arithmetic
//!
//! This module holds the resolved capacity type and the per-bucket state that
//! lives in the shared cache, together with the pure replenishment rules.
//! Nothing here performs I/O; the ledger feeds it a timestamp and persists
//! whatever it returns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sentinel meaning "no limit" in tier lists and policy documents
pub const NO_LIMIT: i64 = -1;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Grid units per token: one millisecond at capacity `C` credits exactly `C`
const UNITS_PER_TOKEN: i64 = 3_600_000;

fn to_units(tokens: f64) -> i64 {
    (tokens * UNITS_PER_TOKEN as f64).round() as i64
}

fn from_units(units: i64) -> f64 {
    units as f64 / UNITS_PER_TOKEN as f64
}

/// Resolved hourly capacity for a (tier, action) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capacity {
    /// No bucket accounting at all
    Unlimited,
    /// Bucket size and hourly refill amount
    PerHour(u32),
}

impl Capacity {
    /// Interpret a configured value, where `NO_LIMIT` means unlimited
    ///
    /// Returns `None` for negative values other than the sentinel.
    pub fn from_configured(value: i64) -> Option<Self> {
        match value {
            NO_LIMIT => Some(Capacity::Unlimited),
            v if v < 0 => None,
            v => Some(Capacity::PerHour(u32::try_from(v).unwrap_or(u32::MAX))),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Capacity::Unlimited)
    }

    /// Tokens replenished per second
    pub fn refill_rate(&self) -> Option<f64> {
        match self {
            Capacity::Unlimited => None,
            Capacity::PerHour(n) => Some(*n as f64 / SECONDS_PER_HOUR),
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Unlimited => write!(f, "unlimited"),
            Capacity::PerHour(n) => write!(f, "{}/hour", n),
        }
    }
}

/// Token bucket state for one (user, action) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Available tokens, fractional between refills
    pub tokens: f64,

    /// Epoch milliseconds of the last write
    pub last_update_millis: i64,
}

impl BucketState {
    /// A full bucket as seen by a user with no stored state
    pub fn full(capacity_per_hour: u32, now_millis: i64) -> Self {
        Self {
            tokens: capacity_per_hour as f64,
            last_update_millis: now_millis,
        }
    }

    /// Credit elapsed time since the last update, capped at capacity
    ///
    /// Tokens are counted on a grid of `1 / 3_600_000` token, so each
    /// elapsed millisecond adds an integral number of units and repeated
    /// partial refills sum exactly.
    ///
    /// A clock that reads earlier than the stored timestamp credits nothing
    /// and keeps the stored timestamp, so timestamps never move backwards.
    pub fn replenished(&self, capacity_per_hour: u32, now_millis: i64) -> Self {
        let capacity = i64::from(capacity_per_hour);
        let elapsed_millis = now_millis.saturating_sub(self.last_update_millis).max(0);
        let units = to_units(self.tokens)
            .saturating_add(elapsed_millis.saturating_mul(capacity))
            .clamp(0, capacity * UNITS_PER_TOKEN);

        Self {
            tokens: from_units(units),
            last_update_millis: self.last_update_millis.max(now_millis),
        }
    }

    /// Whether at least one whole token is available
    pub fn has_token(&self) -> bool {
        to_units(self.tokens) >= UNITS_PER_TOKEN
    }

    /// Remove one token; caller must have checked `has_token`
    pub fn consumed(&self) -> Self {
        Self {
            tokens: from_units(to_units(self.tokens) - UNITS_PER_TOKEN),
            ..*self
        }
    }

    /// Time until one whole token is available again
    pub fn retry_after(&self, capacity_per_hour: u32) -> Duration {
        if self.has_token() {
            return Duration::ZERO;
        }
        if capacity_per_hour == 0 {
            return Duration::MAX;
        }

        let needed = (UNITS_PER_TOKEN - to_units(self.tokens)) as u64;
        let capacity = u64::from(capacity_per_hour);
        Duration::from_millis(needed.div_ceil(capacity))
    }
}
