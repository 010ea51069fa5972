//! ListPermissions: every relation a user holds, found by walking the tuple
//! graph backwards from the user and then deciding each candidate forward.

use crate::{
    error::{Result, ZanzibarError},
    evaluator::{EvaluationLimits, Evaluator},
    models::{ObjectRef, Permission, UserRef},
    registry::{NamespaceRegistry, RegistrySnapshot},
    store::{Revision, TupleStore},
};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

pub struct PermissionLister {
    store: Arc<dyn TupleStore>,
    registry: Arc<NamespaceRegistry>,
    limits: EvaluationLimits,
}

impl PermissionLister {
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

    /// Lists every relation of every object reachable from `user_id`,
    /// each with its decision, sorted by namespace, object and relation.
    pub async fn list(&self, user_id: &str, revision: Revision) -> Result<Vec<Permission>> {
        let user: UserRef = user_id.parse()?;
        let snapshot = self.registry.snapshot();

        tokio::time::timeout(self.limits.timeout, self.list_inner(user, snapshot, revision))
            .await
            .map_err(|_| ZanzibarError::Timeout {
                timeout_ms: self.limits.timeout.as_millis() as u64,
            })?
    }

    async fn list_inner(
        &self,
        user: UserRef,
        snapshot: Arc<RegistrySnapshot>,
        revision: Revision,
    ) -> Result<Vec<Permission>> {
        let reached = self.reachable_objects(&user, &snapshot, revision).await?;

        let mut candidates = Vec::new();
        for object in &reached {
            let namespace = snapshot.namespace(&object.namespace)?;
            for relation in namespace.relation_names() {
                candidates.push((object.clone(), relation.to_string()));
            }
        }

        let evaluator = Evaluator::new(self.store.clone(), snapshot.clone(), revision, self.limits);
        let evaluator = &evaluator;
        let user = &user;
        let mut permissions: Vec<Permission> = stream::iter(candidates)
            .map(|(object, relation)| async move {
                let allowed = evaluator.decide(object.clone(), &relation, user).await?;
                Ok::<_, ZanzibarError>(Permission {
                    namespace: object.namespace,
                    object_id: object.object_id,
                    relation,
                    allowed,
                })
            })
            .buffer_unordered(self.limits.max_concurrent_reads.max(1))
            .try_collect()
            .await?;
        permissions.sort();

        debug!(
            user = %user,
            %revision,
            objects = reached.len(),
            evaluated = permissions.len(),
            granted = permissions.iter().filter(|p| p.allowed).count(),
            "Permissions listed"
        );
        Ok(permissions)
    }

    /// Breadth-first reverse walk. Each hop looks up tuples whose user side is
    /// something already reached: the user itself, a reached object, or a
    /// userset on a reached object.
    async fn reachable_objects(
        &self,
        user: &UserRef,
        snapshot: &RegistrySnapshot,
        revision: Revision,
    ) -> Result<BTreeSet<ObjectRef>> {
        let pairs: Vec<(String, String)> = snapshot
            .namespaces()
            .flat_map(|ns| {
                ns.relation_names()
                    .map(|rel| (ns.name.clone(), rel.to_string()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut reached = BTreeSet::new();
        let mut seen: HashSet<UserRef> = HashSet::from([user.clone()]);
        let mut frontier = vec![user.clone()];
        let mut hops = 0;

        while !frontier.is_empty() && hops < self.limits.max_depth {
            hops += 1;
            let mut next = Vec::new();

            for subject in &frontier {
                for (namespace, relation) in &pairs {
                    let tuples = self
                        .store
                        .find_by_user_relation(namespace, relation, subject, revision)
                        .await?;
                    for tuple in tuples {
                        let object = tuple.object();
                        if !reached.insert(object.clone()) {
                            continue;
                        }
                        for candidate in pointers_to(&object, snapshot) {
                            if seen.insert(candidate.clone()) {
                                next.push(candidate);
                            }
                        }
                    }
                }
            }
            frontier = next;
        }

        if !frontier.is_empty() {
            debug!(user = %user, hops, "Reverse walk stopped at depth limit");
        }
        Ok(reached)
    }
}

/// Every user-side reference that can stand for `object`: the object itself
/// and a userset for each of its relations.
fn pointers_to(object: &ObjectRef, snapshot: &RegistrySnapshot) -> Vec<UserRef> {
    let mut refs = vec![UserRef::Object(object.clone())];
    if let Ok(namespace) = snapshot.namespace(&object.namespace) {
        refs.extend(namespace.relation_names().map(|relation| UserRef::Userset {
            object: object.clone(),
            relation: relation.to_string(),
        }));
    }
    refs
}
