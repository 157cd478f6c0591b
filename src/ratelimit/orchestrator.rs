//! Admission-check orchestration.
//!
//! A check moves through four stages, none of which persist state of their
//! own:
//!
//! 1. **Resolving**: look up the tenant's rule via the [`ConfigResolver`].
//! 2. **Routing**: pick a shard for `api_key:endpoint`. Never fails.
//! 3. **Acquiring**: fetch or build the limiter for the resulting [`ConfigKey`].
//! 4. **Evaluating**: ask the limiter about the caller key.
//!
//! Failures are classified once and returned as-is; nothing here retries.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::LimiterCache;
use super::engine::{EngineError, LimiterEngine, SharedLimiter};
use super::key::ConfigKey;
use super::resolver::{ConfigResolver, RateLimitConfig, ResolveError};
use crate::shard::{ShardSelector, ShardTopology};
use crate::store::{RuleStore, StoreError};

/// Default bound on each store lookup.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default bound on each limiter construction or evaluation.
pub const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a successful admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Quota exhausted for the caller key. Not an error.
    Denied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// HTTP status an HTTP front end should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Decision::Allowed => 200,
            Decision::Denied => 429,
        }
    }
}

/// A classified admission-check failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    /// Unknown API key. The caller must fix its credential.
    #[error("project not found for given API key")]
    ProjectNotFound,

    /// Known API key but no rule for the endpoint. The tenant must add one.
    #[error("endpoint does not belong to this project")]
    EndpointNotOwned,

    /// Transient failure of the project/rule store.
    #[error("rule lookup failed: {0}")]
    Store(StoreError),

    /// The engine could not build a limiter.
    #[error("limiter construction failed: {0}")]
    EngineConstruction(EngineError),

    /// The limiter failed to evaluate the caller key.
    #[error("limiter evaluation failed: {0}")]
    Engine(EngineError),
}

impl CheckError {
    /// Whether retrying the same check later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CheckError::Store(_) | CheckError::EngineConstruction(_) | CheckError::Engine(_)
        )
    }

    /// HTTP status an HTTP front end should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            CheckError::ProjectNotFound => 401,
            CheckError::EndpointNotOwned => 403,
            CheckError::Store(_) | CheckError::EngineConstruction(_) | CheckError::Engine(_) => 500,
        }
    }
}

impl From<ResolveError> for CheckError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::ProjectNotFound => CheckError::ProjectNotFound,
            ResolveError::EndpointNotOwned => CheckError::EndpointNotOwned,
            ResolveError::Store(err) => CheckError::Store(err),
        }
    }
}

/// Time bounds applied to every external call made during a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub store: Duration,
    pub engine: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            store: DEFAULT_STORE_TIMEOUT,
            engine: DEFAULT_ENGINE_TIMEOUT,
        }
    }
}

/// Process-wide routing context: topology, limiter cache and engine.
///
/// Constructed explicitly and handed to the orchestrator, so separate
/// instances (for example one per test) never share state.
pub struct RateLimitRouter {
    topology: Arc<ShardTopology>,
    cache: LimiterCache,
    engine: Arc<dyn LimiterEngine>,
}

impl RateLimitRouter {
    pub fn new(topology: ShardTopology, engine: Arc<dyn LimiterEngine>) -> Self {
        if topology.is_degraded() {
            warn!("Shard topology has no nodes, every limiter will use the fallback node");
        }

        Self {
            topology: Arc::new(topology),
            cache: LimiterCache::new(),
            engine,
        }
    }

    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    pub fn cache(&self) -> &LimiterCache {
        &self.cache
    }

    /// Compute the limiter identity for a resolved configuration.
    pub fn route(&self, api_key: &str, endpoint: &str, config: &RateLimitConfig) -> ConfigKey {
        let routing_key = ShardSelector::routing_key(api_key, endpoint);
        let shard = ShardSelector::select(&config.topology, &routing_key);

        ConfigKey::new(api_key, endpoint, shard, config.limit, config.window)
    }

    /// Get the limiter for `key`, constructing it if needed.
    ///
    /// `timeout` bounds the whole call, including time spent waiting on a
    /// construction started by another caller.
    pub async fn acquire(
        &self,
        key: &ConfigKey,
        config: &RateLimitConfig,
        timeout: Duration,
    ) -> Result<SharedLimiter, EngineError> {
        let acquired = self
            .cache
            .get_or_create(key, || self.engine.construct(config, &key.shard));

        match tokio::time::timeout(timeout, acquired).await {
            Ok(limiter) => limiter,
            Err(_) => {
                warn!(key = %key, ?timeout, "Timed out acquiring limiter");
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    /// Periodically release expired per-caller limiter state and, when
    /// `max_idle` is set, evict limiters idle for longer than it.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Option<Duration>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Some(max_idle) = max_idle {
                    let evicted = router.cache.evict_idle(max_idle);
                    if evicted > 0 {
                        info!(
                            evicted,
                            remaining = router.cache.len(),
                            "Evicted idle limiters"
                        );
                    }
                }

                let released = router.cache.sweep_limiters();
                if released > 0 {
                    debug!(released, "Released expired caller state");
                }
            }
        })
    }
}

/// Entry point for admission checks.
pub struct CheckOrchestrator {
    resolver: ConfigResolver,
    router: Arc<RateLimitRouter>,
    timeouts: Timeouts,
}

impl CheckOrchestrator {
    pub fn new(store: Arc<dyn RuleStore>, router: Arc<RateLimitRouter>, timeouts: Timeouts) -> Self {
        let resolver = ConfigResolver::new(store, Arc::clone(router.topology()), timeouts.store);
        Self {
            resolver,
            router,
            timeouts,
        }
    }

    pub fn router(&self) -> &Arc<RateLimitRouter> {
        &self.router
    }

    /// Decide whether the request identified by `caller_key` may proceed.
    pub async fn check(
        &self,
        api_key: &str,
        endpoint: &str,
        caller_key: &str,
    ) -> Result<Decision, CheckError> {
        let config = self.resolver.resolve(api_key, endpoint).await?;

        let key = self.router.route(api_key, endpoint, &config);
        debug!(key = %key, "Routed limiter");

        let limiter = self
            .router
            .acquire(&key, &config, self.timeouts.engine)
            .await
            .map_err(CheckError::EngineConstruction)?;

        let allowed = tokio::time::timeout(self.timeouts.engine, limiter.allow(caller_key))
            .await
            .map_err(|_| CheckError::Engine(EngineError::Timeout(self.timeouts.engine)))?
            .map_err(CheckError::Engine)?;

        if allowed {
            Ok(Decision::Allowed)
        } else {
            warn!(
                component = "limiter",
                api_key,
                endpoint,
                key = caller_key,
                "Rate limit exceeded"
            );
            Ok(Decision::Denied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::engine::Limiter;
    use crate::ratelimit::memory::MemoryEngine;
    use crate::shard::ShardStrategy;
    use crate::store::{InMemoryStore, KeyBy, Rule, RuleSpec, Strategy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed_window(endpoint: &str, limit: u64, window_seconds: u64) -> RuleSpec {
        RuleSpec {
            endpoint: endpoint.to_string(),
            strategy: Strategy::FixedWindow,
            key_by: KeyBy::Ip,
            limit,
            window_seconds,
        }
    }

    fn topology() -> ShardTopology {
        ShardTopology::new(["nodeA", "nodeB", "nodeC"], ShardStrategy::HashMod)
    }

    fn orchestrator_with(
        store: Arc<InMemoryStore>,
        engine: Arc<dyn LimiterEngine>,
    ) -> CheckOrchestrator {
        let router = Arc::new(RateLimitRouter::new(topology(), engine));
        CheckOrchestrator::new(store, router, Timeouts::default())
    }

    /// Counts constructions and delegates to the in-memory engine.
    #[derive(Default)]
    struct CountingEngine {
        constructed: AtomicUsize,
        shards: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LimiterEngine for CountingEngine {
        async fn construct(
            &self,
            config: &RateLimitConfig,
            shard: &str,
        ) -> Result<SharedLimiter, EngineError> {
            self.constructed.fetch_add(1, Ordering::SeqCst);
            self.shards.lock().push(shard.to_string());
            MemoryEngine::new().construct(config, shard).await
        }
    }

    struct BrokenEngine;

    #[async_trait]
    impl LimiterEngine for BrokenEngine {
        async fn construct(
            &self,
            _config: &RateLimitConfig,
            _shard: &str,
        ) -> Result<SharedLimiter, EngineError> {
            Err(EngineError::Unavailable("redis down".into()))
        }
    }

    struct StalledEngine;

    #[async_trait]
    impl LimiterEngine for StalledEngine {
        async fn construct(
            &self,
            _config: &RateLimitConfig,
            _shard: &str,
        ) -> Result<SharedLimiter, EngineError> {
            std::future::pending().await
        }
    }

    struct ErroringLimiter;

    #[async_trait]
    impl Limiter for ErroringLimiter {
        async fn allow(&self, _key: &str) -> Result<bool, EngineError> {
            Err(EngineError::Unavailable("connection reset".into()))
        }
    }

    struct ErroringEngine;

    #[async_trait]
    impl LimiterEngine for ErroringEngine {
        async fn construct(
            &self,
            _config: &RateLimitConfig,
            _shard: &str,
        ) -> Result<SharedLimiter, EngineError> {
            Ok(Arc::new(ErroringLimiter))
        }
    }

    fn seeded(limit: u64) -> (Arc<InMemoryStore>, Rule) {
        let store = InMemoryStore::new();
        let project = store.register_project_with_key("demo", "k1").unwrap();
        let rule = store.add_rule(project.id, fixed_window("/v1/x", limit, 60)).unwrap();
        (Arc::new(store), rule)
    }

    #[tokio::test]
    async fn test_end_to_end_fixed_window() {
        let (store, _) = seeded(2);
        let engine = Arc::new(CountingEngine::default());
        let orchestrator = orchestrator_with(store, engine.clone());

        let decisions = vec![
            orchestrator.check("k1", "/v1/x", "caller1").await.unwrap(),
            orchestrator.check("k1", "/v1/x", "caller1").await.unwrap(),
            orchestrator.check("k1", "/v1/x", "caller1").await.unwrap(),
        ];
        assert_eq!(decisions, vec![Decision::Allowed, Decision::Allowed, Decision::Denied]);

        // One limiter served all three checks, on a single stable shard
        assert_eq!(engine.constructed.load(Ordering::SeqCst), 1);
        let topo = topology();
        let expected_shard = ShardSelector::select(&topo, "k1:/v1/x");
        assert_eq!(engine.shards.lock().as_slice(), &[expected_shard.to_string()]);

        // Another caller has its own quota
        assert_eq!(
            orchestrator.check("k1", "/v1/x", "caller2").await,
            Ok(Decision::Allowed)
        );
    }

    #[tokio::test]
    async fn test_unknown_api_key_short_circuits() {
        let (store, _) = seeded(2);
        let engine = Arc::new(CountingEngine::default());
        let orchestrator = orchestrator_with(store, engine.clone());

        let err = orchestrator.check("nope", "/v1/x", "caller1").await.unwrap_err();
        assert_eq!(err, CheckError::ProjectNotFound);
        assert_eq!(err.http_status(), 401);
        assert!(!err.is_retryable());

        assert_eq!(engine.constructed.load(Ordering::SeqCst), 0);
        assert!(orchestrator.router().cache().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_endpoint() {
        let (store, _) = seeded(2);
        let orchestrator = orchestrator_with(store, Arc::new(MemoryEngine::new()));

        let err = orchestrator.check("k1", "/v1/other", "caller1").await.unwrap_err();
        assert_eq!(err, CheckError::EndpointNotOwned);
        assert_eq!(err.http_status(), 403);
        assert!(orchestrator.router().cache().is_empty());
    }

    #[tokio::test]
    async fn test_rule_edit_creates_new_limiter() {
        let (store, rule) = seeded(1);
        let engine = Arc::new(CountingEngine::default());
        let orchestrator = orchestrator_with(store.clone(), engine.clone());

        assert_eq!(orchestrator.check("k1", "/v1/x", "c").await, Ok(Decision::Allowed));
        assert_eq!(orchestrator.check("k1", "/v1/x", "c").await, Ok(Decision::Denied));

        store
            .update_rule(rule.project_id, rule.id, fixed_window("/v1/x", 3, 60))
            .unwrap();

        // Fresh limiter with the new quota; the old one is left alone
        assert_eq!(orchestrator.check("k1", "/v1/x", "c").await, Ok(Decision::Allowed));
        assert_eq!(engine.constructed.load(Ordering::SeqCst), 2);
        assert_eq!(orchestrator.router().cache().len(), 2);
    }

    #[tokio::test]
    async fn test_construction_failure_is_classified_and_retried() {
        let (store, _) = seeded(2);
        let orchestrator = orchestrator_with(store, Arc::new(BrokenEngine));

        for _ in 0..2 {
            let err = orchestrator.check("k1", "/v1/x", "caller1").await.unwrap_err();
            assert_eq!(
                err,
                CheckError::EngineConstruction(EngineError::Unavailable("redis down".into()))
            );
            assert!(err.is_retryable());
            assert_eq!(err.http_status(), 500);
        }
        assert_eq!(orchestrator.router().cache().constructions(), 0);
    }

    #[tokio::test]
    async fn test_evaluation_failure_is_not_downgraded() {
        let (store, _) = seeded(2);
        let orchestrator = orchestrator_with(store, Arc::new(ErroringEngine));

        assert_eq!(
            orchestrator.check("k1", "/v1/x", "caller1").await,
            Err(CheckError::Engine(EngineError::Unavailable("connection reset".into())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_construction_is_bounded() {
        let (store, _) = seeded(2);
        let router = Arc::new(RateLimitRouter::new(topology(), Arc::new(StalledEngine)));
        let timeouts = Timeouts {
            store: Duration::from_secs(1),
            engine: Duration::from_millis(300),
        };
        let orchestrator = CheckOrchestrator::new(store, router, timeouts);

        assert_eq!(
            orchestrator.check("k1", "/v1/x", "caller1").await,
            Err(CheckError::EngineConstruction(EngineError::Timeout(
                Duration::from_millis(300)
            )))
        );
        assert!(orchestrator.router().cache().get(&ConfigKey::new(
            "k1",
            "/v1/x",
            ShardSelector::select(&topology(), "k1:/v1/x"),
            2,
            Duration::from_secs(60),
        ))
        .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_share_the_construction_deadline() {
        let (store, _) = seeded(2);
        let router = Arc::new(RateLimitRouter::new(topology(), Arc::new(StalledEngine)));
        let timeouts = Timeouts {
            store: Duration::from_secs(1),
            engine: Duration::from_millis(300),
        };
        let orchestrator = Arc::new(CheckOrchestrator::new(store, router, timeouts));

        let checks = (0..8).map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                let result = orchestrator
                    .check("k1", "/v1/x", &format!("caller{}", i))
                    .await;
                (result, started.elapsed())
            })
        });

        for joined in futures::future::join_all(checks).await {
            let (result, elapsed) = joined.unwrap();
            assert_eq!(
                result,
                Err(CheckError::EngineConstruction(EngineError::Timeout(
                    Duration::from_millis(300)
                )))
            );
            assert!(elapsed <= Duration::from_millis(350), "waited {:?}", elapsed);
        }
    }

    #[tokio::test]
    async fn test_empty_topology_routes_to_fallback() {
        let (store, _) = seeded(2);
        let engine = Arc::new(CountingEngine::default());
        let router = Arc::new(RateLimitRouter::new(
            ShardTopology::new(Vec::<String>::new(), ShardStrategy::ConsistentHash),
            engine.clone(),
        ));
        let orchestrator = CheckOrchestrator::new(store, router, Timeouts::default());

        assert_eq!(orchestrator.check("k1", "/v1/x", "c").await, Ok(Decision::Allowed));
        assert_eq!(
            engine.shards.lock().as_slice(),
            &[crate::shard::FALLBACK_NODE.to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_share_one_limiter() {
        let (store, _) = seeded(1_000);
        let engine = Arc::new(CountingEngine::default());
        let orchestrator = Arc::new(orchestrator_with(store, engine.clone()));

        let checks = (0..64).map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .check("k1", "/v1/x", &format!("caller{}", i % 4))
                    .await
            })
        });

        for joined in futures::future::join_all(checks).await {
            assert_eq!(joined.unwrap(), Ok(Decision::Allowed));
        }
        assert_eq!(engine.constructed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decision_status_codes() {
        assert_eq!(Decision::Allowed.http_status(), 200);
        assert_eq!(Decision::Denied.http_status(), 429);
        assert!(Decision::Allowed.is_allowed());
        assert!(!Decision::Denied.is_allowed());
    }

    #[test]
    fn test_store_errors_map_to_retryable_check_errors() {
        let err = CheckError::from(ResolveError::Store(StoreError::Timeout(Duration::from_secs(1))));
        assert!(matches!(err, CheckError::Store(_)));
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_idle_limiters() {
        let (store, _) = seeded(2);
        let orchestrator = orchestrator_with(store, Arc::new(MemoryEngine::new()));
        orchestrator.check("k1", "/v1/x", "c").await.unwrap();
        assert_eq!(orchestrator.router().cache().len(), 1);

        let sweeper = orchestrator
            .router()
            .spawn_sweeper(Duration::from_secs(1), Some(Duration::ZERO));
        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(orchestrator.router().cache().is_empty());
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_releases_caller_state_without_eviction() {
        let (store, _) = seeded(2);
        let orchestrator = orchestrator_with(store, Arc::new(MemoryEngine::new()));
        for caller in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            orchestrator.check("k1", "/v1/x", caller).await.unwrap();
        }

        let sweeper = orchestrator
            .router()
            .spawn_sweeper(Duration::from_secs(30), None);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Windows of 60s have passed by the third tick
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(orchestrator.router().cache().len(), 1);
        assert_eq!(orchestrator.router().cache().sweep_limiters(), 0);
        sweeper.abort();
    }
}
