//! Deterministic routing of rate limit configurations to backend shards.
//!
//! A [`ShardTopology`] is built once at startup from configuration and shared
//! read-only by every admission check. [`ShardSelector`] maps a routing key to
//! one of the topology's node addresses without any I/O or locking.

mod selector;

pub use selector::{fnv1a_32, ShardSelector, ShardStrategy, ShardTopology, FALLBACK_NODE};
