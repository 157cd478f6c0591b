//! Limiter engine capability traits.
//!
//! The counting algorithm and whatever state it keeps (in process, or on a
//! remote counting store reached through the selected shard) live behind
//! these two traits. The admission path only constructs limiters and asks
//! them for decisions.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::resolver::RateLimitConfig;

/// Errors reported by a limiter engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not build a limiter for the configuration.
    #[error("limiter construction failed: {0}")]
    Construction(String),

    /// The counting backend is unreachable or returned an error.
    #[error("counting backend unavailable: {0}")]
    Unavailable(String),

    /// The engine call did not finish within the allotted time.
    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),
}

/// A stateful limiter bound to one configuration.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Count one request for `key` and report whether it is within quota.
    async fn allow(&self, key: &str) -> Result<bool, EngineError>;

    /// Drop per-key state that can no longer affect a decision, returning how
    /// many keys were released. Limiters keeping state remotely have nothing
    /// to do here.
    fn sweep(&self) -> usize {
        0
    }
}

/// Shared handle to a constructed limiter.
pub type SharedLimiter = Arc<dyn Limiter>;

/// Builds limiters.
#[async_trait]
pub trait LimiterEngine: Send + Sync {
    /// Construct a limiter for `config`, keeping its state on `shard`.
    async fn construct(
        &self,
        config: &RateLimitConfig,
        shard: &str,
    ) -> Result<SharedLimiter, EngineError>;
}
