use crate::{
    error::{Result, ZanzibarError},
    evaluator::{EvaluationLimits, Evaluator},
    models::{ExpandTree, ObjectRef},
    registry::NamespaceRegistry,
    store::{Revision, TupleStore},
};
use std::sync::Arc;
use tracing::debug;

/// Enumerates the full userset of a relation as a tree
pub struct ExpandEngine {
    store: Arc<dyn TupleStore>,
    registry: Arc<NamespaceRegistry>,
    limits: EvaluationLimits,
}

impl ExpandEngine {
    pub fn new(
        store: Arc<dyn TupleStore>,
        registry: Arc<NamespaceRegistry>,
        limits: EvaluationLimits,
    ) -> Self {
        Self {
            store,
            registry,
            limits,
        }
    }

    /// Expands `namespace:object_id#relation` at `revision`.
    ///
    /// Branches cut at the depth limit show up as `Truncated` leaves and set
    /// `truncated` on the tree instead of failing the request.
    pub async fn expand(
        &self,
        namespace: &str,
        object_id: &str,
        relation: &str,
        revision: Revision,
    ) -> Result<ExpandTree> {
        let snapshot = self.registry.snapshot();
        let evaluator = Evaluator::new(self.store.clone(), snapshot, revision, self.limits);

        let root = tokio::time::timeout(
            self.limits.timeout,
            evaluator.enumerate(ObjectRef::new(namespace, object_id), relation),
        )
        .await
        .map_err(|_| ZanzibarError::Timeout {
            timeout_ms: self.limits.timeout.as_millis() as u64,
        })??;

        debug!(
            namespace,
            object_id,
            relation,
            %revision,
            users = root.users.len(),
            truncated = root.truncated,
            store_reads = evaluator.reads_issued(),
            "Expand evaluated"
        );

        Ok(ExpandTree {
            truncated: root.truncated,
            root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExpandOperation;
    use crate::store::InMemoryTupleStore;

    #[tokio::test]
    async fn test_expand_folder_viewers() {
        let store = Arc::new(InMemoryTupleStore::new());
        for tuple in [
            "folders:root#owner@alice",
            "folders:root#viewer@groups:eng#member",
            "groups:eng#member@bob",
            "folders:child#parent@folders:root",
            "folders:child#editor@carol",
        ] {
            store.write(tuple.parse().unwrap());
        }
        let revision = store.current_revision().await.unwrap();
        let engine = ExpandEngine::new(
            store,
            Arc::new(NamespaceRegistry::with_defaults().unwrap()),
            EvaluationLimits::default(),
        );

        let tree = engine.expand("folders", "child", "viewer", revision).await.unwrap();
        assert!(!tree.truncated);
        let users: Vec<&str> = tree.users().iter().map(String::as_str).collect();
        assert_eq!(users, vec!["alice", "bob", "carol"]);

        assert_eq!(tree.root.operation, ExpandOperation::Relation);
        assert_eq!(tree.root.target.as_deref(), Some("folders:child#viewer"));
        assert_eq!(tree.root.children[0].operation, ExpandOperation::Union);
        assert_eq!(tree.root.children[0].children.len(), 3);
    }

    #[tokio::test]
    async fn test_expand_unknown_namespace() {
        let engine = ExpandEngine::new(
            Arc::new(InMemoryTupleStore::new()),
            Arc::new(NamespaceRegistry::with_defaults().unwrap()),
            EvaluationLimits::default(),
        );
        assert!(matches!(
            engine.expand("patients", "p1", "viewer", Revision(0)).await,
            Err(ZanzibarError::NamespaceNotFound(_))
        ));
    }
}
