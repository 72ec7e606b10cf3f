//! Rate-Limited Principals
//!
//! The gate only needs three facts about a caller; anything that can answer
//! them can be rate limited.

use serde::{Deserialize, Serialize};

/// Identifier shared by guests that have no session of their own
pub const GUEST_IDENTIFIER: &str = ":guest";

/// What the admission gate needs to know about a caller
pub trait RateLimitSubject: Send + Sync {
    /// Superusers are never limited
    fn is_superuser(&self) -> bool;

    /// Assigned tier; `None` for guests, who use the configured guest tier
    fn rate_limit_tier(&self) -> Option<u32>;

    /// Stable identifier used to key buckets
    fn identifier(&self) -> &str;
}

/// Standard principal kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum User {
    /// Administrative user, exempt from limits
    Superuser { identifier: String },

    /// Signed-in user with an assigned tier
    Authenticated { identifier: String, tier: u32 },

    /// Anonymous caller, optionally scoped to a session
    Guest { session: Option<String> },
}

impl User {
    pub fn superuser(identifier: impl Into<String>) -> Self {
        User::Superuser {
            identifier: identifier.into(),
        }
    }

    pub fn authenticated(identifier: impl Into<String>, tier: u32) -> Self {
        User::Authenticated {
            identifier: identifier.into(),
            tier,
        }
    }

    /// Guest sharing the global guest bucket
    pub fn guest() -> Self {
        User::Guest { session: None }
    }

    /// Guest with a bucket of its own
    pub fn guest_session(session: impl Into<String>) -> Self {
        User::Guest {
            session: Some(session.into()),
        }
    }

    /// Change the tier of an authenticated user; other kinds are unchanged
    pub fn set_tier(&mut self, new_tier: u32) {
        if let User::Authenticated { tier, .. } = self {
            *tier = new_tier;
        }
    }
}

impl RateLimitSubject for User {
    fn is_superuser(&self) -> bool {
        matches!(self, User::Superuser { .. })
    }

    fn rate_limit_tier(&self) -> Option<u32> {
        match self {
            User::Authenticated { tier, .. } => Some(*tier),
            User::Superuser { .. } | User::Guest { .. } => None,
        }
    }

    fn identifier(&self) -> &str {
        match self {
            User::Superuser { identifier } | User::Authenticated { identifier, .. } => identifier,
            User::Guest { session: Some(session) } => session,
            User::Guest { session: None } => GUEST_IDENTIFIER,
        }
    }
}
