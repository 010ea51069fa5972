//! Collaborator failure handling
//!
//! The tuple store failing is fatal to the request and surfaced as transient.
//! The result cache failing only costs latency.

use async_trait::async_trait;
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;
use zanzibar_engine::*;

mock! {
    pub Store {}

    #[async_trait]
    impl TupleStore for Store {
        async fn current_revision(&self) -> Result<Revision>;

        async fn find_by_object_relation(
            &self,
            namespace: &str,
            object_id: &str,
            relation: &str,
            revision: Revision,
        ) -> Result<Vec<RelationTuple>>;

        async fn find_by_user_relation(
            &self,
            namespace: &str,
            relation: &str,
            user: &UserRef,
            revision: Revision,
        ) -> Result<Vec<RelationTuple>>;
    }
}

mock! {
    pub Cache {}

    #[async_trait]
    impl ResultCache for Cache {
        async fn get(&self, key: &CacheKey) -> Result<Option<bool>>;

        async fn put(&self, key: &CacheKey, allowed: bool, ttl: Duration) -> Result<()>;
    }
}

fn registry() -> Arc<NamespaceRegistry> {
    Arc::new(NamespaceRegistry::with_defaults().unwrap())
}

fn broken_cache() -> MockCache {
    let mut cache = MockCache::new();
    cache
        .expect_get()
        .returning(|_| Err(ZanzibarError::CacheUnavailable("connection reset".into())));
    cache
        .expect_put()
        .returning(|_, _, _| Err(ZanzibarError::CacheUnavailable("connection reset".into())));
    cache
}

#[tokio::test]
async fn test_store_unavailable_fails_request() {
    let mut store = MockStore::new();
    store.expect_current_revision().returning(|| Ok(Revision(7)));
    store
        .expect_find_by_object_relation()
        .returning(|_, _, _, _| Err(ZanzibarError::TupleStoreUnavailable("connection refused".into())));

    let engine = AuthorizationEngine::new(Arc::new(store), registry());
    let err = engine
        .check(&CheckRequest::new("documents", "doc1", "viewer", "alice"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ZanzibarError::TupleStoreUnavailable(_)));
    assert!(err.is_transient());
    assert_eq!(err.code(), "AUTHZ_STORE_UNAVAILABLE");
}

#[tokio::test]
async fn test_store_unavailable_on_token_issue() {
    let mut store = MockStore::new();
    store
        .expect_current_revision()
        .returning(|| Err(ZanzibarError::TupleStoreUnavailable("timeout".into())));

    let engine = AuthorizationEngine::new(Arc::new(store), registry());
    assert!(matches!(
        engine.expand("documents", "doc1", "viewer", None).await,
        Err(ZanzibarError::TupleStoreUnavailable(_))
    ));
    assert!(engine.health_check().await.is_err());
}

#[tokio::test]
async fn test_cache_unavailable_degrades_to_miss() {
    let tuples = Arc::new(InMemoryTupleStore::new());
    tuples.write("documents:doc1#owner@alice".parse().unwrap());

    let engine = AuthorizationEngine::new(tuples, registry()).with_cache(Arc::new(broken_cache()));

    let result = engine
        .check(&CheckRequest::new("documents", "doc1", "viewer", "alice"), None)
        .await
        .unwrap();
    assert!(result.allowed);

    let report = engine.health_check().await.unwrap();
    assert_eq!(report.state, HealthState::Degraded);
    assert!(report.cache_error.is_some());
}

#[tokio::test]
async fn test_cache_hit_skips_store_reads() {
    let mut store = MockStore::new();
    store.expect_current_revision().returning(|| Ok(Revision(3)));
    store.expect_find_by_object_relation().times(0);

    let mut cache = MockCache::new();
    cache.expect_get().times(1).returning(|_| Ok(Some(true)));
    cache.expect_put().times(0);

    let engine = AuthorizationEngine::new(Arc::new(store), registry()).with_cache(Arc::new(cache));
    let result = engine
        .check(&CheckRequest::new("documents", "doc1", "viewer", "alice"), None)
        .await
        .unwrap();
    assert!(result.allowed);
}

#[tokio::test]
async fn test_batch_isolates_store_failures_per_item() {
    let mut store = MockStore::new();
    store.expect_current_revision().returning(|| Ok(Revision(1)));
    store
        .expect_find_by_object_relation()
        .returning(|namespace, object_id, relation, _| {
            if object_id == "broken" {
                return Err(ZanzibarError::TupleStoreUnavailable("shard offline".into()));
            }
            if relation == "owner" {
                return Ok(vec![RelationTuple::new(
                    namespace,
                    object_id,
                    relation,
                    UserRef::user("alice"),
                )]);
            }
            Ok(Vec::new())
        });

    let engine = AuthorizationEngine::new(Arc::new(store), registry());
    let batch = engine
        .batch_check(
            &[
                CheckRequest::new("documents", "doc1", "owner", "alice"),
                CheckRequest::new("documents", "broken", "owner", "alice"),
                CheckRequest::new("documents", "doc2", "viewer", "alice"),
            ],
            None,
        )
        .await
        .unwrap();

    assert!(matches!(batch.results[0], Ok(true)));
    assert!(matches!(batch.results[1], Err(ZanzibarError::TupleStoreUnavailable(_))));
    assert!(matches!(batch.results[2], Ok(true)));
}
