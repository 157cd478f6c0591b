//! Shard selection strategies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node address returned when the topology has no nodes at all.
pub const FALLBACK_NODE: &str = "redis://localhost:6379/0";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash of `input`.
pub fn fnv1a_32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// How routing keys are mapped onto nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ShardStrategy {
    /// `fnv1a(key) mod node_count`.
    HashMod,
    /// Nearest node clockwise on a 32-bit ring, one point per node.
    ///
    /// There are no virtual nodes, so load is only as even as the node
    /// addresses happen to hash.
    ConsistentHash,
    /// Any other tag. Selection always yields the first node.
    Unknown(String),
}

impl ShardStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            ShardStrategy::HashMod => "hash_mod",
            ShardStrategy::ConsistentHash => "consistent_hash",
            ShardStrategy::Unknown(tag) => tag,
        }
    }
}

impl Default for ShardStrategy {
    fn default() -> Self {
        ShardStrategy::HashMod
    }
}

impl From<&str> for ShardStrategy {
    fn from(tag: &str) -> Self {
        match tag {
            "hash_mod" => ShardStrategy::HashMod,
            "consistent_hash" => ShardStrategy::ConsistentHash,
            other => ShardStrategy::Unknown(other.to_string()),
        }
    }
}

impl From<String> for ShardStrategy {
    fn from(tag: String) -> Self {
        ShardStrategy::from(tag.as_str())
    }
}

impl From<ShardStrategy> for String {
    fn from(strategy: ShardStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

impl fmt::Display for ShardStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered list of backend node addresses plus the strategy used to pick
/// among them.
///
/// Built once before any check is served and never mutated afterwards, so it
/// can be shared behind an `Arc` and read without synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTopology {
    nodes: Vec<String>,
    strategy: ShardStrategy,
}

impl ShardTopology {
    /// Create a topology, dropping blank node entries.
    pub fn new<I, S>(nodes: I, strategy: ShardStrategy) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = nodes
            .into_iter()
            .map(Into::into)
            .filter(|node: &String| !node.trim().is_empty())
            .collect();

        Self { nodes, strategy }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn strategy(&self) -> &ShardStrategy {
        &self.strategy
    }

    /// `true` when every selection will degrade to [`FALLBACK_NODE`].
    pub fn is_degraded(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Pure mapping from a routing key to a node address.
pub struct ShardSelector;

impl ShardSelector {
    /// Select the node responsible for `routing_key`.
    ///
    /// Never fails: an empty topology yields [`FALLBACK_NODE`] and an unknown
    /// strategy yields the first node.
    pub fn select<'a>(topology: &'a ShardTopology, routing_key: &str) -> &'a str {
        let nodes = topology.nodes();
        if nodes.is_empty() {
            return FALLBACK_NODE;
        }

        match topology.strategy() {
            ShardStrategy::HashMod => Self::hash_mod(nodes, routing_key),
            ShardStrategy::ConsistentHash => Self::consistent_hash(nodes, routing_key),
            ShardStrategy::Unknown(_) => &nodes[0],
        }
    }

    /// Routing key for a tenant endpoint.
    pub fn routing_key(api_key: &str, endpoint: &str) -> String {
        format!("{}:{}", api_key, endpoint)
    }

    fn hash_mod<'a>(nodes: &'a [String], routing_key: &str) -> &'a str {
        let index = fnv1a_32(routing_key) % nodes.len() as u32;
        &nodes[index as usize]
    }

    fn consistent_hash<'a>(nodes: &'a [String], routing_key: &str) -> &'a str {
        let key_hash = fnv1a_32(routing_key);

        // min_by_key keeps the first of equal minimums, so ties go to list order
        nodes
            .iter()
            .min_by_key(|node| Self::forward_distance(key_hash, fnv1a_32(node)))
            .map(String::as_str)
            .unwrap_or(nodes[0].as_str())
    }

    fn forward_distance(key_hash: u32, node_hash: u32) -> u32 {
        if node_hash >= key_hash {
            node_hash - key_hash
        } else {
            (u32::MAX - key_hash) + node_hash
        }
    }
}
