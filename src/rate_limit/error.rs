//! Rate Limit Error Types
//!
//! Errors raised while loading policy, talking to the shared cache, or
//! resolving a contended bucket update.

/// Result alias for rate limiting operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Error types for rate limiting operations
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Policy document could not be parsed
    #[error("Policy parse error: {0}")]
    Policy(#[from] serde_json::Error),

    /// Policy document parsed but holds invalid values
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Invalid configuration (tier overrides, cache settings)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shared cache unavailable, timed out or returned a corrupt value
    #[error("Cache backend error: {0}")]
    Cache(String),

    /// Compare-and-swap lost the race too many times
    #[error("Bucket {key} still contended after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
}

impl RateLimitError {
    /// Whether this error came from the cache backend rather than configuration
    pub fn is_backend(&self) -> bool {
        matches!(self, RateLimitError::Cache(_) | RateLimitError::Contention { .. })
    }
}

#[cfg(feature = "redis-cache")]
impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError::Cache(err.to_string())
    }
}
