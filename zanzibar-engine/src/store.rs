use crate::{
    error::Result,
    models::{RelationTuple, TupleKey, UserRef},
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A point in the tuple store's history. Reads at a revision observe
/// exactly the tuples that were live when it was current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read side of the relationship graph consumed by the engine
#[async_trait]
pub trait TupleStore: Send + Sync {
    /// Latest committed revision
    async fn current_revision(&self) -> Result<Revision>;

    /// Tuples matching `namespace:object_id#relation`
    async fn find_by_object_relation(
        &self,
        namespace: &str,
        object_id: &str,
        relation: &str,
        revision: Revision,
    ) -> Result<Vec<RelationTuple>>;

    /// Tuples in `namespace` with `relation` whose user side is `user`
    async fn find_by_user_relation(
        &self,
        namespace: &str,
        relation: &str,
        user: &UserRef,
        revision: Revision,
    ) -> Result<Vec<RelationTuple>>;
}

/// Batch of writes and deletes committed under one revision
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteRequest {
    pub writes: Vec<RelationTuple>,
    pub deletes: Vec<RelationTuple>,
}

#[derive(Debug, Clone)]
struct TupleVersion {
    tuple: RelationTuple,
    created: u64,
    deleted: Option<u64>,
}

impl TupleVersion {
    fn visible_at(&self, revision: Revision) -> bool {
        self.created <= revision.0 && self.deleted.map_or(true, |d| d > revision.0)
    }

    fn is_live(&self) -> bool {
        self.deleted.is_none()
    }
}

type ObjectKey = (String, String, String);
type UserKey = (String, String, UserRef);

/// Multi-version in-memory tuple store for testing and development
pub struct InMemoryTupleStore {
    by_object: DashMap<ObjectKey, Vec<TupleVersion>>,
    by_user: DashMap<UserKey, BTreeSet<String>>,
    revision: AtomicU64,
    write_lock: Mutex<()>,
}

impl InMemoryTupleStore {
    pub fn new() -> Self {
        Self {
            by_object: DashMap::new(),
            by_user: DashMap::new(),
            revision: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    fn object_key(tuple: &RelationTuple) -> ObjectKey {
        (
            tuple.namespace.clone(),
            tuple.object_id.clone(),
            tuple.relation.clone(),
        )
    }

    fn user_key(tuple: &RelationTuple) -> UserKey {
        (
            tuple.namespace.clone(),
            tuple.relation.clone(),
            tuple.user.clone(),
        )
    }

    /// Writes a tuple. Writing a key that is already live only refreshes
    /// `updated_at`.
    pub fn write(&self, tuple: RelationTuple) -> Revision {
        self.batch_write(WriteRequest {
            writes: vec![tuple],
            deletes: Vec::new(),
        })
    }

    pub fn delete(&self, tuple: &RelationTuple) -> Revision {
        self.batch_write(WriteRequest {
            writes: Vec::new(),
            deletes: vec![tuple.clone()],
        })
    }

    /// Applies all writes, then all deletes, under a single new revision.
    /// The revision is published only after every change is in place, so
    /// readers never see half of a batch.
    pub fn batch_write(&self, request: WriteRequest) -> Revision {
        let _guard = self.write_lock.lock();
        let next = self.revision.load(Ordering::Acquire) + 1;
        let mut changed = false;

        for tuple in request.writes {
            changed |= self.apply_write(tuple, next);
        }
        for tuple in &request.deletes {
            changed |= self.apply_delete(&tuple.key(), next);
        }

        if changed {
            self.revision.store(next, Ordering::Release);
            debug!(revision = next, "Tuple store revision committed");
            Revision(next)
        } else {
            Revision(next - 1)
        }
    }

    fn apply_write(&self, tuple: RelationTuple, revision: u64) -> bool {
        let mut versions = self.by_object.entry(Self::object_key(&tuple)).or_default();

        if let Some(live) = versions
            .iter_mut()
            .find(|v| v.is_live() && v.tuple.user == tuple.user)
        {
            live.tuple.updated_at = Utc::now();
            return false;
        }

        let now = Utc::now();
        let mut stored = tuple;
        stored.created_at = now;
        stored.updated_at = now;

        self.by_user
            .entry(Self::user_key(&stored))
            .or_default()
            .insert(stored.object_id.clone());
        versions.push(TupleVersion {
            tuple: stored,
            created: revision,
            deleted: None,
        });
        true
    }

    fn apply_delete(&self, key: &TupleKey, revision: u64) -> bool {
        let object_key = (
            key.namespace.clone(),
            key.object_id.clone(),
            key.relation.clone(),
        );
        let Some(mut versions) = self.by_object.get_mut(&object_key) else {
            return false;
        };

        match versions
            .iter_mut()
            .find(|v| v.is_live() && v.tuple.user == key.user)
        {
            Some(live) => {
                live.deleted = Some(revision);
                true
            }
            None => false,
        }
    }

    /// Drops versions deleted at or before `horizon`. Reads at revisions
    /// older than the horizon are no longer answered faithfully.
    pub fn compact(&self, horizon: Revision) {
        let _guard = self.write_lock.lock();
        self.by_object.retain(|_, versions| {
            versions.retain(|v| v.deleted.map_or(true, |d| d > horizon.0));
            !versions.is_empty()
        });
    }

    /// Number of live tuples
    pub fn len(&self) -> usize {
        self.by_object
            .iter()
            .map(|entry| entry.value().iter().filter(|v| v.is_live()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTupleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TupleStore for InMemoryTupleStore {
    async fn current_revision(&self) -> Result<Revision> {
        Ok(Revision(self.revision.load(Ordering::Acquire)))
    }

    async fn find_by_object_relation(
        &self,
        namespace: &str,
        object_id: &str,
        relation: &str,
        revision: Revision,
    ) -> Result<Vec<RelationTuple>> {
        let key = (
            namespace.to_string(),
            object_id.to_string(),
            relation.to_string(),
        );
        Ok(self
            .by_object
            .get(&key)
            .map(|versions| {
                versions
                    .iter()
                    .filter(|v| v.visible_at(revision))
                    .map(|v| v.tuple.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_by_user_relation(
        &self,
        namespace: &str,
        relation: &str,
        user: &UserRef,
        revision: Revision,
    ) -> Result<Vec<RelationTuple>> {
        let key = (namespace.to_string(), relation.to_string(), user.clone());
        let object_ids: Vec<String> = match self.by_user.get(&key) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };

        let mut tuples = Vec::new();
        for object_id in object_ids {
            let object_key = (namespace.to_string(), object_id, relation.to_string());
            if let Some(versions) = self.by_object.get(&object_key) {
                tuples.extend(
                    versions
                        .iter()
                        .filter(|v| v.visible_at(revision) && v.tuple.user == *user)
                        .map(|v| v.tuple.clone()),
                );
            }
        }
        Ok(tuples)
    }
}
