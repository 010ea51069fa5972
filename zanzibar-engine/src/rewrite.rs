//! Rewrite-rule expression trees.
//!
//! Each relation of a namespace carries a rewrite rule describing how its
//! userset is computed. Rules are stored as JSON payloads in the shape
//! `{"union":{"child":[{"_this":{}},{"computed_userset":{"relation":"owner"}}]}}`
//! and parsed once per registry version into [`UsersetExpression`].

use crate::error::{Result, ZanzibarError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parsed rewrite rule of a relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsersetExpression {
    /// Direct tuples naming the relation itself
    This,
    /// Same object, different relation
    ComputedUserset { relation: String },
    /// Follow `tupleset_relation` to other objects, then evaluate
    /// `computed_relation` there
    TupleToUserset {
        tupleset_relation: String,
        computed_relation: String,
    },
    Union(Vec<UsersetExpression>),
    Intersection(Vec<UsersetExpression>),
    Exclusion {
        base: Box<UsersetExpression>,
        exclude: Box<UsersetExpression>,
    },
}

impl UsersetExpression {
    /// Parses a stored payload for `namespace#relation`, checking every
    /// same-object reference against `known_relations`.
    ///
    /// An empty payload is the plain `This` rule.
    pub fn parse(
        namespace: &str,
        relation: &str,
        payload: &str,
        known_relations: &[&str],
    ) -> Result<Self> {
        if payload.trim().is_empty() {
            return Ok(Self::This);
        }

        let rule: RuleNode = serde_json::from_str(payload)
            .map_err(|e| ZanzibarError::invalid_rule(namespace, relation, e.to_string()))?;
        let expression = Self::from_rule(rule, namespace, relation)?;

        for referenced in expression.local_references() {
            if !known_relations.contains(&referenced) {
                return Err(ZanzibarError::invalid_rule(
                    namespace,
                    relation,
                    format!("references unknown relation '{}'", referenced),
                ));
            }
        }

        Ok(expression)
    }

    fn from_rule(rule: RuleNode, namespace: &str, relation: &str) -> Result<Self> {
        let convert_children = |children: Vec<RuleNode>, kind: &str| -> Result<Vec<Self>> {
            if children.is_empty() {
                return Err(ZanzibarError::invalid_rule(
                    namespace,
                    relation,
                    format!("{} without children", kind),
                ));
            }
            children
                .into_iter()
                .map(|child| Self::from_rule(child, namespace, relation))
                .collect()
        };

        let expression = match rule {
            RuleNode::This(_) => Self::This,
            RuleNode::ComputedUserset(target) => Self::ComputedUserset {
                relation: non_empty(target.relation, namespace, relation)?,
            },
            RuleNode::TupleToUserset(ttu) => Self::TupleToUserset {
                tupleset_relation: non_empty(ttu.tupleset.relation, namespace, relation)?,
                computed_relation: non_empty(ttu.computed_userset.relation, namespace, relation)?,
            },
            RuleNode::Union(set) => Self::Union(convert_children(set.child, "union")?),
            RuleNode::Intersection(set) => {
                Self::Intersection(convert_children(set.child, "intersection")?)
            }
            RuleNode::Exclusion(exclusion) => Self::Exclusion {
                base: Box::new(Self::from_rule(*exclusion.base, namespace, relation)?),
                exclude: Box::new(Self::from_rule(*exclusion.subtract, namespace, relation)?),
            },
        };
        Ok(expression)
    }

    /// Relations of the same namespace this expression reads directly.
    pub fn local_references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_local_references(&mut out);
        out
    }

    fn collect_local_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::This => {}
            Self::ComputedUserset { relation } => out.push(relation),
            Self::TupleToUserset {
                tupleset_relation, ..
            } => out.push(tupleset_relation),
            Self::Union(children) | Self::Intersection(children) => {
                for child in children {
                    child.collect_local_references(out);
                }
            }
            Self::Exclusion { base, exclude } => {
                base.collect_local_references(out);
                exclude.collect_local_references(out);
            }
        }
    }

    /// Serializes back into the stored payload shape.
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(&RuleNode::from(self))
            .map_err(|e| ZanzibarError::Internal(anyhow::anyhow!(e)))
    }
}

fn non_empty(value: String, namespace: &str, relation: &str) -> Result<String> {
    if value.is_empty() {
        return Err(ZanzibarError::invalid_rule(
            namespace,
            relation,
            "empty relation reference",
        ));
    }
    Ok(value)
}

impl fmt::Display for UsersetExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, name: &str, children: &[Self]| {
            write!(f, "{}(", name)?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", child)?;
            }
            write!(f, ")")
        };

        match self {
            Self::This => write!(f, "this"),
            Self::ComputedUserset { relation } => write!(f, "computed({})", relation),
            Self::TupleToUserset {
                tupleset_relation,
                computed_relation,
            } => write!(f, "tuple_to_userset({}, {})", tupleset_relation, computed_relation),
            Self::Union(children) => join(f, "union", children),
            Self::Intersection(children) => join(f, "intersection", children),
            Self::Exclusion { base, exclude } => write!(f, "exclusion({}, {})", base, exclude),
        }
    }
}

// Stored payload shape

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Empty {}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelationRef {
    relation: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SetOperation {
    child: Vec<RuleNode>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TupleToUsersetRule {
    tupleset: RelationRef,
    computed_userset: RelationRef,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExclusionRule {
    base: Box<RuleNode>,
    subtract: Box<RuleNode>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RuleNode {
    #[serde(rename = "_this")]
    This(Empty),
    ComputedUserset(RelationRef),
    TupleToUserset(TupleToUsersetRule),
    Union(SetOperation),
    Intersection(SetOperation),
    Exclusion(ExclusionRule),
}

impl From<&UsersetExpression> for RuleNode {
    fn from(expression: &UsersetExpression) -> Self {
        match expression {
            UsersetExpression::This => Self::This(Empty {}),
            UsersetExpression::ComputedUserset { relation } => Self::ComputedUserset(RelationRef {
                relation: relation.clone(),
            }),
            UsersetExpression::TupleToUserset {
                tupleset_relation,
                computed_relation,
            } => Self::TupleToUserset(TupleToUsersetRule {
                tupleset: RelationRef {
                    relation: tupleset_relation.clone(),
                },
                computed_userset: RelationRef {
                    relation: computed_relation.clone(),
                },
            }),
            UsersetExpression::Union(children) => Self::Union(SetOperation {
                child: children.iter().map(Self::from).collect(),
            }),
            UsersetExpression::Intersection(children) => Self::Intersection(SetOperation {
                child: children.iter().map(Self::from).collect(),
            }),
            UsersetExpression::Exclusion { base, exclude } => Self::Exclusion(ExclusionRule {
                base: Box::new(Self::from(base.as_ref())),
                subtract: Box::new(Self::from(exclude.as_ref())),
            }),
        }
    }
}
