use crate::{
    cache::{CacheKey, ResultCache},
    error::{Result, ZanzibarError},
    evaluator::{EvaluationLimits, Evaluator},
    models::{CheckRequest, ObjectRef, UserRef},
    registry::NamespaceRegistry,
    store::{Revision, TupleStore},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Answers "does user U have relation R on object O?" at a pinned revision.
///
/// Only top-level decisions are memoized. Sub-evaluations are not: a branch
/// cut short by the cycle guard is empty only relative to the path that
/// reached it, so its result is not reusable on its own.
pub struct CheckEngine {
    store: Arc<dyn TupleStore>,
    registry: Arc<NamespaceRegistry>,
    cache: Arc<dyn ResultCache>,
    cache_ttl: Duration,
    limits: EvaluationLimits,
}

impl CheckEngine {
    pub fn new(
        store: Arc<dyn TupleStore>,
        registry: Arc<NamespaceRegistry>,
        cache: Arc<dyn ResultCache>,
        cache_ttl: Duration,
        limits: EvaluationLimits,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            cache_ttl,
            limits,
        }
    }

    pub fn limits(&self) -> EvaluationLimits {
        self.limits
    }

    /// Decides `request` against the tuples visible at `revision`.
    ///
    /// # Errors
    ///
    /// Unknown namespaces and relations, malformed users, depth and time
    /// limits, and tuple store failures. Cache failures are not errors.
    pub async fn check(&self, request: &CheckRequest, revision: Revision) -> Result<bool> {
        let user: UserRef = request.user_id.parse()?;
        let snapshot = self.registry.snapshot();
        snapshot.resolve(&request.namespace, &request.relation)?;

        let key = CacheKey::for_check(
            &request.namespace,
            &request.object_id,
            &request.relation,
            &request.user_id,
            revision,
            snapshot.version(),
        );

        match self.cache.get(&key).await {
            Ok(Some(allowed)) => {
                debug!(%request, %revision, allowed, "Check served from cache");
                return Ok(allowed);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Result cache read failed, evaluating"),
        }

        let evaluator = Evaluator::new(self.store.clone(), snapshot, revision, self.limits);
        let object = ObjectRef::new(&request.namespace, &request.object_id);
        let allowed = tokio::time::timeout(
            self.limits.timeout,
            evaluator.decide(object, &request.relation, &user),
        )
        .await
        .map_err(|_| ZanzibarError::Timeout {
            timeout_ms: self.limits.timeout.as_millis() as u64,
        })??;

        debug!(
            %request,
            %revision,
            allowed,
            store_reads = evaluator.reads_issued(),
            "Check evaluated"
        );

        if let Err(e) = self.cache.put(&key, allowed, self.cache_ttl).await {
            warn!(error = %e, "Result cache write failed");
        }

        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryResultCache, NoopResultCache};
    use crate::store::InMemoryTupleStore;

    fn engine(store: Arc<InMemoryTupleStore>, cache: Arc<dyn ResultCache>) -> CheckEngine {
        CheckEngine::new(
            store,
            Arc::new(NamespaceRegistry::with_defaults().unwrap()),
            cache,
            Duration::from_secs(60),
            EvaluationLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_check_inherited_relations() {
        let store = Arc::new(InMemoryTupleStore::new());
        store.write("documents:doc1#owner@alice".parse().unwrap());
        let revision = store.current_revision().await.unwrap();
        let checker = engine(store, Arc::new(NoopResultCache));

        for relation in ["owner", "editor", "viewer"] {
            let request = CheckRequest::new("documents", "doc1", relation, "alice");
            assert!(checker.check(&request, revision).await.unwrap(), "{relation}");
        }

        let request = CheckRequest::new("documents", "doc1", "viewer", "bob");
        assert!(!checker.check(&request, revision).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_rejects_unknown_relation_and_bad_user() {
        let store = Arc::new(InMemoryTupleStore::new());
        let checker = engine(store, Arc::new(NoopResultCache));

        let unknown = CheckRequest::new("documents", "doc1", "approver", "alice");
        assert!(matches!(
            checker.check(&unknown, Revision(0)).await,
            Err(ZanzibarError::RelationNotFound { .. })
        ));

        let bad_user = CheckRequest::new("documents", "doc1", "viewer", "groups:#member");
        assert!(matches!(
            checker.check(&bad_user, Revision(0)).await,
            Err(ZanzibarError::InvalidUserRef(_))
        ));
    }

    #[tokio::test]
    async fn test_cached_decision_is_per_revision() {
        let store = Arc::new(InMemoryTupleStore::new());
        let cache = Arc::new(InMemoryResultCache::default());
        let checker = engine(store.clone(), cache.clone());
        let request = CheckRequest::new("documents", "doc1", "viewer", "alice");

        let before = store.current_revision().await.unwrap();
        assert!(!checker.check(&request, before).await.unwrap());
        assert_eq!(cache.len(), 1);

        let after = store.write("documents:doc1#viewer@alice".parse().unwrap());
        assert!(checker.check(&request, after).await.unwrap());
        // The old revision still answers from its own entry.
        assert!(!checker.check(&request, before).await.unwrap());
        assert_eq!(cache.len(), 2);
    }
}
