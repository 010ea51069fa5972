//! Userset expression evaluator shared by Check and Expand.
//!
//! One evaluator serves one request: it holds the registry snapshot and the
//! tuple revision resolved for that request, so every read made during a
//! multi-hop evaluation sees the same graph.
//!
//! The walk threads an [`EvalContext`] through every hop. Re-entering a
//! `namespace:object#relation` already on the current path contributes
//! nothing to that branch (a relation cannot grant itself); growing the path
//! past `max_depth` aborts a check and truncates an expand branch.
//!
//! Sibling branches of union, intersection and tuple-to-userset nodes are
//! polled concurrently through `FuturesUnordered`; returning early drops the
//! set, which cancels every branch still in flight. A failing branch does not
//! decide a union that another branch proves, nor an intersection that
//! another branch refutes.

use crate::{
    error::{Result, ZanzibarError},
    models::{ExpandNode, ExpandOperation, ObjectRef, RelationTuple, UserRef},
    registry::RegistrySnapshot,
    rewrite::UsersetExpression,
    store::{Revision, TupleStore},
};
use futures::future::try_join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Position of the walk: the relation being evaluated and the path that
/// led to it. Cloned on every hop so concurrent branches never share
/// mutable cycle-tracking state.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub object: ObjectRef,
    pub relation: String,
    pub depth: u32,
    visited: Arc<HashSet<String>>,
}

impl EvalContext {
    fn root() -> Self {
        Self {
            object: ObjectRef::new("", ""),
            relation: String::new(),
            depth: 0,
            visited: Arc::new(HashSet::new()),
        }
    }

    fn descend(&self, object: ObjectRef, relation: String, key: String) -> Self {
        let mut visited = (*self.visited).clone();
        visited.insert(key);
        Self {
            object,
            relation,
            depth: self.depth + 1,
            visited: Arc::new(visited),
        }
    }
}

fn node_key(object: &ObjectRef, relation: &str) -> String {
    format!("{}#{}", object, relation)
}

enum Entry {
    Enter(EvalContext),
    Cycle,
    TooDeep,
}

/// Bounds applied to every evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationLimits {
    pub max_depth: u32,
    pub timeout: Duration,
    /// Tuple store reads one request may have in flight
    pub max_concurrent_reads: usize,
}

impl Default for EvaluationLimits {
    fn default() -> Self {
        Self {
            max_depth: 25,
            timeout: Duration::from_millis(5000),
            max_concurrent_reads: 32,
        }
    }
}

/// Per-request evaluator
pub struct Evaluator {
    store: Arc<dyn TupleStore>,
    registry: Arc<RegistrySnapshot>,
    revision: Revision,
    max_depth: u32,
    timeout: Duration,
    deadline: Instant,
    reads: Semaphore,
    reads_issued: AtomicUsize,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn TupleStore>,
        registry: Arc<RegistrySnapshot>,
        revision: Revision,
        limits: EvaluationLimits,
    ) -> Self {
        Self {
            store,
            registry,
            revision,
            max_depth: limits.max_depth,
            timeout: limits.timeout,
            deadline: Instant::now() + limits.timeout,
            reads: Semaphore::new(limits.max_concurrent_reads.max(1)),
            reads_issued: AtomicUsize::new(0),
        }
    }

    /// Number of tuple store reads issued so far
    pub fn reads_issued(&self) -> usize {
        self.reads_issued.load(Ordering::Relaxed)
    }

    /// Decides whether `user` holds `relation` on `object`
    pub async fn decide(&self, object: ObjectRef, relation: &str, user: &UserRef) -> Result<bool> {
        self.registry.resolve(&object.namespace, relation)?;
        self.decide_relation(&EvalContext::root(), object, relation.to_string(), user)
            .await
    }

    /// Enumerates every identifier holding `relation` on `object`
    pub async fn enumerate(&self, object: ObjectRef, relation: &str) -> Result<ExpandNode> {
        self.registry.resolve(&object.namespace, relation)?;
        if self.max_depth == 0 {
            return Err(ZanzibarError::MaxDepthExceeded {
                max_depth: self.max_depth,
            });
        }
        self.expand_relation(&EvalContext::root(), object, relation.to_string())
            .await
    }

    fn enter(&self, parent: &EvalContext, object: ObjectRef, relation: String) -> Entry {
        let key = node_key(&object, &relation);
        if parent.visited.contains(&key) {
            debug!(node = %key, depth = parent.depth, "Cycle on evaluation path, branch is empty");
            return Entry::Cycle;
        }
        if parent.depth >= self.max_depth {
            return Entry::TooDeep;
        }
        Entry::Enter(parent.descend(object, relation, key))
    }

    async fn read(&self, object: &ObjectRef, relation: &str) -> Result<Vec<RelationTuple>> {
        if Instant::now() >= self.deadline {
            return Err(ZanzibarError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        let _permit = self
            .reads
            .acquire()
            .await
            .map_err(|_| ZanzibarError::Internal(anyhow::anyhow!("read limiter closed")))?;
        self.reads_issued.fetch_add(1, Ordering::Relaxed);
        self.store
            .find_by_object_relation(&object.namespace, &object.object_id, relation, self.revision)
            .await
    }

    /// The object a tupleset tuple points at. A plain user on the user side
    /// of a tupleset relation has nothing to follow.
    fn tupleset_target<'t>(&self, ctx: &EvalContext, tuple: &'t RelationTuple) -> Result<&'t ObjectRef> {
        tuple.user.as_object().ok_or_else(|| {
            ZanzibarError::invalid_rule(
                &ctx.object.namespace,
                &ctx.relation,
                format!(
                    "tupleset tuple {} does not reference an object",
                    tuple
                ),
            )
        })
    }

    // Decide

    fn decide_relation<'a>(
        &'a self,
        parent: &EvalContext,
        object: ObjectRef,
        relation: String,
        user: &'a UserRef,
    ) -> BoxFuture<'a, Result<bool>> {
        let ctx = match self.enter(parent, object, relation) {
            Entry::Enter(ctx) => ctx,
            Entry::Cycle => return Box::pin(async { Ok(false) }),
            Entry::TooDeep => {
                let max_depth = self.max_depth;
                return Box::pin(async move { Err(ZanzibarError::MaxDepthExceeded { max_depth }) });
            }
        };

        Box::pin(async move {
            let expression = self
                .registry
                .resolve(&ctx.object.namespace, &ctx.relation)?;
            self.decide_expr(expression, &ctx, user).await
        })
    }

    fn decide_expr<'a>(
        &'a self,
        expression: &'a UsersetExpression,
        ctx: &'a EvalContext,
        user: &'a UserRef,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            match expression {
                UsersetExpression::This => {
                    let tuples = self.read(&ctx.object, &ctx.relation).await?;
                    if tuples.iter().any(|t| t.user == *user) {
                        return Ok(true);
                    }
                    let branches = tuples.into_iter().filter_map(|t| match t.user {
                        UserRef::Userset { object, relation } => {
                            Some(self.decide_relation(ctx, object, relation, user))
                        }
                        _ => None,
                    });
                    any_true(branches).await
                }
                UsersetExpression::ComputedUserset { relation } => {
                    self.decide_relation(ctx, ctx.object.clone(), relation.clone(), user)
                        .await
                }
                UsersetExpression::TupleToUserset {
                    tupleset_relation,
                    computed_relation,
                } => {
                    let tuples = self.read(&ctx.object, tupleset_relation).await?;
                    let mut branches = Vec::with_capacity(tuples.len());
                    for tuple in &tuples {
                        let target = self.tupleset_target(ctx, tuple)?;
                        branches.push(self.decide_relation(
                            ctx,
                            target.clone(),
                            computed_relation.clone(),
                            user,
                        ));
                    }
                    any_true(branches).await
                }
                UsersetExpression::Union(children) => {
                    any_true(children.iter().map(|c| self.decide_expr(c, ctx, user))).await
                }
                UsersetExpression::Intersection(children) => {
                    all_true(children.iter().map(|c| self.decide_expr(c, ctx, user))).await
                }
                UsersetExpression::Exclusion { base, exclude } => {
                    if self.decide_expr(exclude, ctx, user).await? {
                        return Ok(false);
                    }
                    self.decide_expr(base, ctx, user).await
                }
            }
        })
    }

    // Enumerate

    fn expand_relation<'a>(
        &'a self,
        parent: &EvalContext,
        object: ObjectRef,
        relation: String,
    ) -> BoxFuture<'a, Result<ExpandNode>> {
        let target = Some(node_key(&object, &relation));
        let ctx = match self.enter(parent, object, relation) {
            Entry::Enter(ctx) => ctx,
            Entry::Cycle => {
                return Box::pin(async move { Ok(ExpandNode::leaf(ExpandOperation::Cycle, target)) })
            }
            Entry::TooDeep => {
                debug!(node = ?target, max_depth = self.max_depth, "Expand branch truncated");
                return Box::pin(async move {
                    Ok(ExpandNode::leaf(ExpandOperation::Truncated, target))
                });
            }
        };

        Box::pin(async move {
            let expression = self
                .registry
                .resolve(&ctx.object.namespace, &ctx.relation)?;
            let child = self.expand_expr(expression, &ctx).await?;
            Ok(ExpandNode {
                operation: ExpandOperation::Relation,
                target,
                users: child.users.clone(),
                truncated: child.truncated,
                children: vec![child],
            })
        })
    }

    fn expand_expr<'a>(
        &'a self,
        expression: &'a UsersetExpression,
        ctx: &'a EvalContext,
    ) -> BoxFuture<'a, Result<ExpandNode>> {
        Box::pin(async move {
            let node = match expression {
                UsersetExpression::This => {
                    let tuples = self.read(&ctx.object, &ctx.relation).await?;
                    let mut direct = BTreeSet::new();
                    let mut branches = Vec::new();
                    for tuple in tuples {
                        match tuple.user {
                            UserRef::Userset { object, relation } => {
                                branches.push(self.expand_relation(ctx, object, relation));
                            }
                            other => {
                                direct.insert(other.to_string());
                            }
                        }
                    }
                    let children = try_join_all(branches).await?;
                    let mut node = combine(ExpandOperation::This, None, children, union_of);
                    node.users.extend(direct);
                    node
                }
                UsersetExpression::ComputedUserset { relation } => {
                    let child = self
                        .expand_relation(ctx, ctx.object.clone(), relation.clone())
                        .await?;
                    combine(
                        ExpandOperation::ComputedUserset,
                        Some(relation.clone()),
                        vec![child],
                        union_of,
                    )
                }
                UsersetExpression::TupleToUserset {
                    tupleset_relation,
                    computed_relation,
                } => {
                    let tuples = self.read(&ctx.object, tupleset_relation).await?;
                    let mut branches = Vec::with_capacity(tuples.len());
                    for tuple in &tuples {
                        let target = self.tupleset_target(ctx, tuple)?;
                        branches.push(self.expand_relation(
                            ctx,
                            target.clone(),
                            computed_relation.clone(),
                        ));
                    }
                    let children = try_join_all(branches).await?;
                    combine(
                        ExpandOperation::TupleToUserset,
                        Some(format!("{}->{}", tupleset_relation, computed_relation)),
                        children,
                        union_of,
                    )
                }
                UsersetExpression::Union(children) => {
                    let children =
                        try_join_all(children.iter().map(|c| self.expand_expr(c, ctx))).await?;
                    combine(ExpandOperation::Union, None, children, union_of)
                }
                UsersetExpression::Intersection(children) => {
                    let children =
                        try_join_all(children.iter().map(|c| self.expand_expr(c, ctx))).await?;
                    combine(ExpandOperation::Intersection, None, children, intersection_of)
                }
                UsersetExpression::Exclusion { base, exclude } => {
                    let (base, exclude) = futures::try_join!(
                        self.expand_expr(base, ctx),
                        self.expand_expr(exclude, ctx)
                    )?;
                    combine(ExpandOperation::Exclusion, None, vec![base, exclude], difference_of)
                }
            };
            Ok(node)
        })
    }
}

/// True as soon as one branch is true. An error only wins once every other
/// branch has come back false.
async fn any_true<'a, I>(branches: I) -> Result<bool>
where
    I: IntoIterator<Item = BoxFuture<'a, Result<bool>>>,
{
    let mut pending: FuturesUnordered<_> = branches.into_iter().collect();
    let mut failure = None;
    while let Some(result) = pending.next().await {
        match result {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }
    failure.map_or(Ok(false), Err)
}

/// False as soon as one branch is false. An error only wins once every
/// other branch has come back true.
async fn all_true<'a, I>(branches: I) -> Result<bool>
where
    I: IntoIterator<Item = BoxFuture<'a, Result<bool>>>,
{
    let mut pending: FuturesUnordered<_> = branches.into_iter().collect();
    let mut failure = None;
    while let Some(result) = pending.next().await {
        match result {
            Ok(false) => return Ok(false),
            Ok(true) => {}
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }
    failure.map_or(Ok(true), Err)
}

fn union_of(children: &[ExpandNode]) -> BTreeSet<String> {
    children
        .iter()
        .flat_map(|c| c.users.iter().cloned())
        .collect()
}

fn intersection_of(children: &[ExpandNode]) -> BTreeSet<String> {
    let mut iter = children.iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(first.users.clone(), |acc, child| {
        acc.intersection(&child.users).cloned().collect()
    })
}

fn difference_of(children: &[ExpandNode]) -> BTreeSet<String> {
    match children {
        [base, exclude] => base.users.difference(&exclude.users).cloned().collect(),
        _ => BTreeSet::new(),
    }
}

fn combine(
    operation: ExpandOperation,
    target: Option<String>,
    children: Vec<ExpandNode>,
    users: fn(&[ExpandNode]) -> BTreeSet<String>,
) -> ExpandNode {
    ExpandNode {
        operation,
        target,
        users: users(&children),
        truncated: children.iter().any(|c| c.truncated),
        children,
    }
}
