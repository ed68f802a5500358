//! Rate limiter trait for abstracting limiter implementations.

use async_trait::async_trait;

use super::limiter::LimitOptions;
use crate::error::LimitError;

/// Trait for rate limiter implementations.
///
/// The admission middleware talks to its token and IP limiters through this
/// trait, so either can be swapped for a fake in tests.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Check and record a request for `identity`.
    ///
    /// Returns `Ok(true)` when the caller is over its limit.
    async fn limit(&self, identity: &str, options: Option<&LimitOptions>)
        -> Result<bool, LimitError>;
}
