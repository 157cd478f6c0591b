//! Configuration management for Tollgate.
//!
//! Values are layered from, in increasing priority: built-in defaults, an
//! optional YAML file, and `TOLLGATE__`-prefixed environment variables using
//! `__` as the section separator, e.g.
//!
//! ```text
//! TOLLGATE__SERVER__GRPC_ADDR=0.0.0.0:8081
//! TOLLGATE__TOPOLOGY__NODES=redis://10.0.0.1:6379/0,redis://10.0.0.2:6379/0
//! TOLLGATE__TOPOLOGY__STRATEGY=consistent_hash
//! ```

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::Timeouts;
use crate::shard::{ShardStrategy, ShardTopology};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend shard topology
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Limiter timeouts and cache housekeeping
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Project and rule store
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Backend node addresses and the strategy used to shard across them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Ordered node addresses. Blank entries are ignored.
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,

    /// `hash_mod` or `consistent_hash`
    #[serde(default)]
    pub strategy: ShardStrategy,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            strategy: ShardStrategy::default(),
        }
    }
}

fn default_nodes() -> Vec<String> {
    vec![
        "redis://localhost:6379/0".to_string(),
        "redis://localhost:6380/0".to_string(),
        "redis://localhost:6381/0".to_string(),
    ]
}

impl TopologyConfig {
    /// Build the read-only topology used for routing.
    pub fn to_topology(&self) -> ShardTopology {
        ShardTopology::new(self.nodes.iter().cloned(), self.strategy.clone())
    }
}

/// Limiter timeouts and cache housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Bound on each project/rule lookup in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Bound on each limiter construction or evaluation in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub engine_timeout_ms: u64,

    /// Evict limiters unused for this many seconds. Unset keeps them forever.
    #[serde(default)]
    pub idle_eviction_secs: Option<u64>,

    /// How often to release expired caller state and look for idle limiters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_timeout_ms(),
            engine_timeout_ms: default_timeout_ms(),
            idle_eviction_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_sweep_interval() -> u64 {
    60
}

impl LimiterConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            store: Duration::from_millis(self.store_timeout_ms),
            engine: Duration::from_millis(self.engine_timeout_ms),
        }
    }

    pub fn idle_eviction(&self) -> Option<Duration> {
        self.idle_eviction_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Project and rule store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// YAML file of projects and rules loaded at startup
    pub seed_path: Option<String>,
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix("TOLLGATE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("topology.nodes")
            .try_parsing(true)
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config: TollgateConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file only.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TollgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.limiter.store_timeout_ms == 0 || self.limiter.engine_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "limiter timeouts must be positive".to_string(),
            ));
        }
        if self.limiter.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
