//! Admission-check resolution: rule lookup, limiter caching and evaluation.

mod cache;
mod engine;
mod key;
mod memory;
mod orchestrator;
mod resolver;

pub use cache::LimiterCache;
pub use engine::{EngineError, Limiter, LimiterEngine, SharedLimiter};
pub use key::ConfigKey;
pub use memory::{MemoryEngine, MemoryLimiter};
pub use orchestrator::{
    CheckError, CheckOrchestrator, Decision, RateLimitRouter, Timeouts, DEFAULT_ENGINE_TIMEOUT,
    DEFAULT_STORE_TIMEOUT,
};
pub use resolver::{ConfigResolver, RateLimitConfig, ResolveError};
