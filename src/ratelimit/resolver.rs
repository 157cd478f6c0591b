//! Resolution of (API key, endpoint) to an effective rate limit configuration.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::shard::ShardTopology;
use crate::store::{KeyBy, RuleStore, StoreError, Strategy};

/// Why a configuration could not be resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No project owns the API key.
    #[error("project not found for given API key")]
    ProjectNotFound,

    /// The project exists but has no rule for the endpoint.
    #[error("endpoint does not belong to this project")]
    EndpointNotOwned,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything needed to build and route a limiter for one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub strategy: Strategy,
    pub key_by: KeyBy,
    /// Requests allowed per window
    pub limit: u64,
    pub window: Duration,
    /// Topology snapshot used to route this configuration
    pub topology: Arc<ShardTopology>,
}

/// Looks up the rule governing an endpoint on every call.
///
/// There is no caching at this level; each resolution performs two store
/// lookups, each bounded by the resolver's timeout.
pub struct ConfigResolver {
    store: Arc<dyn RuleStore>,
    topology: Arc<ShardTopology>,
    timeout: Duration,
}

impl ConfigResolver {
    pub fn new(store: Arc<dyn RuleStore>, topology: Arc<ShardTopology>, timeout: Duration) -> Self {
        Self {
            store,
            topology,
            timeout,
        }
    }

    /// Resolve the configuration for `endpoint` under `api_key`.
    ///
    /// Both lookups are exact matches with no normalization.
    pub async fn resolve(
        &self,
        api_key: &str,
        endpoint: &str,
    ) -> Result<RateLimitConfig, ResolveError> {
        let project_id = self
            .bounded(self.store.find_project_id_by_api_key(api_key))
            .await?
            .ok_or(ResolveError::ProjectNotFound)?;

        trace!(project_id, endpoint, "Resolved project");

        let rule = self
            .bounded(self.store.find_rule(project_id, endpoint))
            .await?
            .ok_or(ResolveError::EndpointNotOwned)?;

        debug!(
            project_id,
            rule_id = rule.id,
            endpoint,
            strategy = %rule.strategy,
            limit = rule.limit,
            window_secs = rule.window.as_secs(),
            "Resolved rate limit rule"
        );

        Ok(RateLimitConfig {
            strategy: rule.strategy,
            key_by: rule.key_by,
            limit: rule.limit,
            window: rule.window,
            topology: Arc::clone(&self.topology),
        })
    }

    async fn bounded<T, F>(&self, lookup: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}
