//! Tollgate - Rate Limiting as a Service
//!
//! Tenants register projects identified by an API key and attach rules
//! (endpoint, strategy, caller discrimination, quota, window) to them. Every
//! downstream request is then admitted or rejected through a single check that
//! resolves the tenant's rule, routes it to a backend shard, and evaluates a
//! long-lived limiter memoized per configuration.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod shard;
pub mod store;
