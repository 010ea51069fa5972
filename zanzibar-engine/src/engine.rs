use crate::{
    batch::BatchCheckCoordinator,
    cache::{CacheKey, InMemoryResultCache, NoopResultCache, RedisResultCache, ResultCache},
    check::CheckEngine,
    config::{CacheBackend, CacheConfig, EngineConfig},
    error::{Result, ZanzibarError},
    expand::ExpandEngine,
    models::{CheckRequest, ExpandTree, Permission},
    permissions::PermissionLister,
    registry::{NamespaceConfig, NamespaceConfigStore, NamespaceRegistry},
    store::{Revision, TupleStore},
    token::{ConsistencyToken, ConsistencyTokenManager},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outcome of a check, with the token the decision was made at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub token: ConsistencyToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandResult {
    pub tree: ExpandTree,
    pub token: ConsistencyToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPermissionsResult {
    pub permissions: Vec<Permission>,
    pub token: ConsistencyToken,
}

/// Per-item outcomes of a batch, in request order
#[derive(Debug)]
pub struct BatchCheckResult {
    pub results: Vec<Result<bool>>,
    pub token: ConsistencyToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// Answering correctly, without the result cache
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub revision: Revision,
    pub registry_version: u64,
    pub cache_error: Option<String>,
}

/// Builds the result cache selected by `config`
pub async fn build_result_cache(config: &CacheConfig) -> Result<Arc<dyn ResultCache>> {
    if !config.enabled {
        return Ok(Arc::new(NoopResultCache));
    }
    match config.backend {
        CacheBackend::Memory => Ok(Arc::new(InMemoryResultCache::new(config.max_entries))),
        CacheBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                ZanzibarError::Configuration("cache.redis_url is not set".to_string())
            })?;
            Ok(Arc::new(RedisResultCache::connect(url).await?))
        }
    }
}

/// Zanzibar decision engine.
///
/// Every call resolves exactly one consistency token up front and evaluates
/// against that revision and a single namespace registry snapshot.
pub struct AuthorizationEngine {
    /// Read side of the relationship graph
    store: Arc<dyn TupleStore>,

    /// Parsed rewrite rules, swapped whole on reload
    registry: Arc<NamespaceRegistry>,

    /// Memoized top-level decisions
    cache: Arc<dyn ResultCache>,

    config: EngineConfig,

    tokens: ConsistencyTokenManager,
    checker: Arc<CheckEngine>,
    expander: ExpandEngine,
    lister: PermissionLister,
    batch: BatchCheckCoordinator,
}

impl AuthorizationEngine {
    /// Create an engine with default configuration and no result cache
    pub fn new(store: Arc<dyn TupleStore>, registry: Arc<NamespaceRegistry>) -> Self {
        Self::assemble(store, registry, Arc::new(NoopResultCache), EngineConfig::default())
    }

    /// Create an engine whose cache backend is chosen by `config`
    pub async fn from_config(
        store: Arc<dyn TupleStore>,
        registry: Arc<NamespaceRegistry>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let cache = build_result_cache(&config.cache).await?;
        Ok(Self::assemble(store, registry, cache, config))
    }

    /// Replace the configuration, keeping the current cache
    pub fn with_config(self, config: EngineConfig) -> Self {
        Self::assemble(self.store, self.registry, self.cache, config)
    }

    /// Use `cache` for top-level check results
    pub fn with_cache(self, cache: Arc<dyn ResultCache>) -> Self {
        Self::assemble(self.store, self.registry, cache, self.config)
    }

    fn assemble(
        store: Arc<dyn TupleStore>,
        registry: Arc<NamespaceRegistry>,
        cache: Arc<dyn ResultCache>,
        config: EngineConfig,
    ) -> Self {
        let limits = config.limits();
        let tokens = ConsistencyTokenManager::new(store.clone(), config.token_retention());
        let checker = Arc::new(CheckEngine::new(
            store.clone(),
            registry.clone(),
            cache.clone(),
            config.cache_ttl(),
            limits,
        ));
        let expander = ExpandEngine::new(store.clone(), registry.clone(), limits);
        let lister = PermissionLister::new(store.clone(), registry.clone(), limits);
        let batch = BatchCheckCoordinator::new(checker.clone(), config.batch_max_in_flight);

        Self {
            store,
            registry,
            cache,
            config,
            tokens,
            checker,
            expander,
            lister,
            batch,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Does `request.user_id` hold `request.relation` on the object?
    ///
    /// # Errors
    ///
    /// Token, namespace and relation errors, malformed users, depth and time
    /// limits, and tuple store failures.
    #[instrument(skip(self, token), fields(request = %request))]
    pub async fn check(
        &self,
        request: &CheckRequest,
        token: Option<&ConsistencyToken>,
    ) -> Result<CheckResult> {
        let resolved = self.tokens.resolve(token).await?;
        let allowed = self.checker.check(request, resolved.revision).await?;
        Ok(CheckResult {
            allowed,
            token: resolved.token,
        })
    }

    /// Every identifier holding `relation` on `namespace:object_id`
    #[instrument(skip(self, token))]
    pub async fn expand(
        &self,
        namespace: &str,
        object_id: &str,
        relation: &str,
        token: Option<&ConsistencyToken>,
    ) -> Result<ExpandResult> {
        let resolved = self.tokens.resolve(token).await?;
        let tree = self
            .expander
            .expand(namespace, object_id, relation, resolved.revision)
            .await?;
        Ok(ExpandResult {
            tree,
            token: resolved.token,
        })
    }

    /// Relations on objects reachable from `user_id`, each with its decision
    #[instrument(skip(self, token))]
    pub async fn list_permissions(
        &self,
        user_id: &str,
        token: Option<&ConsistencyToken>,
    ) -> Result<ListPermissionsResult> {
        let resolved = self.tokens.resolve(token).await?;
        let permissions = self.lister.list(user_id, resolved.revision).await?;
        Ok(ListPermissionsResult {
            permissions,
            token: resolved.token,
        })
    }

    /// Checks every item at one shared token. Only token resolution fails the
    /// whole batch; anything else fails its own slot.
    #[instrument(skip(self, items, token), fields(items = items.len()))]
    pub async fn batch_check(
        &self,
        items: &[CheckRequest],
        token: Option<&ConsistencyToken>,
    ) -> Result<BatchCheckResult> {
        let resolved = self.tokens.resolve(token).await?;
        let results = self.batch.check_all(items, resolved.revision).await;
        Ok(BatchCheckResult {
            results,
            token: resolved.token,
        })
    }

    // =============================================================================
    // Namespace Management
    // =============================================================================

    /// Swap in a new namespace configuration. Requests already running keep
    /// the version they started with.
    pub fn reload_namespaces(&self, configs: &[NamespaceConfig]) -> Result<u64> {
        self.registry.reload(configs)
    }

    pub async fn reload_namespaces_from(&self, store: &dyn NamespaceConfigStore) -> Result<u64> {
        self.registry.reload_from_store(store).await
    }

    // =============================================================================
    // Health
    // =============================================================================

    /// Pings the tuple store and the cache. Only a store failure is an error.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let revision = self.store.current_revision().await?;
        let registry_version = self.registry.snapshot().version();

        let ping = CacheKey::for_check("health", "engine", "ping", "engine", revision, 0);
        let cache_error = match self.cache.get(&ping).await {
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Result cache unavailable, serving uncached");
                Some(e.to_string())
            }
        };

        let state = if cache_error.is_some() {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        info!(?state, %revision, registry_version, "Health check completed");

        Ok(HealthReport {
            state,
            revision,
            registry_version,
            cache_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTupleStore;

    fn engine(store: Arc<InMemoryTupleStore>) -> AuthorizationEngine {
        AuthorizationEngine::new(store, Arc::new(NamespaceRegistry::with_defaults().unwrap()))
    }

    #[tokio::test]
    async fn test_check_returns_reusable_token() {
        let store = Arc::new(InMemoryTupleStore::new());
        store.write("documents:doc1#owner@alice".parse().unwrap());
        let engine = engine(store.clone());
        let request = CheckRequest::new("documents", "doc1", "viewer", "bob");

        let first = engine.check(&request, None).await.unwrap();
        assert!(!first.allowed);

        store.write("documents:doc1#viewer@bob".parse().unwrap());

        let pinned = engine.check(&request, Some(&first.token)).await.unwrap();
        assert!(!pinned.allowed);
        assert_eq!(pinned.token, first.token);

        let fresh = engine.check(&request, None).await.unwrap();
        assert!(fresh.allowed);
    }

    #[tokio::test]
    async fn test_reload_namespaces() {
        let engine = engine(Arc::new(InMemoryTupleStore::new()));
        let request = CheckRequest::new("projects", "p1", "member", "alice");
        assert!(matches!(
            engine.check(&request, None).await,
            Err(ZanzibarError::NamespaceNotFound(_))
        ));

        let mut configs = NamespaceConfig::default_namespaces();
        configs.push(NamespaceConfig::new(
            "projects",
            vec![crate::registry::RelationConfig::new("member", "")],
        ));
        assert_eq!(engine.reload_namespaces(&configs).unwrap(), 2);
        assert!(!engine.check(&request, None).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_health_check() {
        let engine = engine(Arc::new(InMemoryTupleStore::new()))
            .with_cache(Arc::new(InMemoryResultCache::default()));
        let report = engine.health_check().await.unwrap();
        assert_eq!(report.state, HealthState::Healthy);
        assert_eq!(report.revision, Revision(0));
        assert_eq!(report.registry_version, 1);
    }

    #[tokio::test]
    async fn test_from_config_without_cache() {
        let mut config = EngineConfig::default();
        config.cache.enabled = false;
        config.max_depth = 3;
        let engine = AuthorizationEngine::from_config(
            Arc::new(InMemoryTupleStore::new()),
            Arc::new(NamespaceRegistry::with_defaults().unwrap()),
            config,
        )
        .await
        .unwrap();
        assert_eq!(engine.config().max_depth, 3);
    }
}
