use crate::error::ZanzibarError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// An object inside a namespace, written `namespace:object_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(namespace: &str, object_id: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object_id: object_id.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.object_id)
    }
}

/// The user side of a relation tuple.
///
/// - `User`: a direct user identifier (`user456`)
/// - `Object`: a reference to another object (`folders:root`), followed by
///   `tuple_to_userset` rules
/// - `Userset`: an indirect set of users (`group:eng#member`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UserRef {
    User(String),
    Object(ObjectRef),
    Userset { object: ObjectRef, relation: String },
}

impl UserRef {
    pub fn user(user_id: &str) -> Self {
        Self::User(user_id.to_string())
    }

    pub fn object(namespace: &str, object_id: &str) -> Self {
        Self::Object(ObjectRef::new(namespace, object_id))
    }

    pub fn userset(namespace: &str, object_id: &str, relation: &str) -> Self {
        Self::Userset {
            object: ObjectRef::new(namespace, object_id),
            relation: relation.to_string(),
        }
    }

    /// The object this reference points at, if it is not a plain user.
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::User(_) => None,
            Self::Object(object) | Self::Userset { object, .. } => Some(object),
        }
    }
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "{}", id),
            Self::Object(object) => write!(f, "{}", object),
            Self::Userset { object, relation } => write!(f, "{}#{}", object, relation),
        }
    }
}

fn parse_object(raw: &str, original: &str) -> Result<ObjectRef, ZanzibarError> {
    let (namespace, object_id) = raw
        .split_once(':')
        .ok_or_else(|| ZanzibarError::InvalidUserRef(original.to_string()))?;
    if namespace.is_empty() || object_id.is_empty() || object_id.contains(':') {
        return Err(ZanzibarError::InvalidUserRef(original.to_string()));
    }
    Ok(ObjectRef::new(namespace, object_id))
}

impl FromStr for UserRef {
    type Err = ZanzibarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains('@') || s.chars().any(char::is_whitespace) {
            return Err(ZanzibarError::InvalidUserRef(s.to_string()));
        }

        if let Some((object, relation)) = s.split_once('#') {
            if relation.is_empty() || relation.contains('#') {
                return Err(ZanzibarError::InvalidUserRef(s.to_string()));
            }
            return Ok(Self::Userset {
                object: parse_object(object, s)?,
                relation: relation.to_string(),
            });
        }

        if s.contains(':') {
            return Ok(Self::Object(parse_object(s, s)?));
        }

        Ok(Self::User(s.to_string()))
    }
}

impl TryFrom<String> for UserRef {
    type Error = ZanzibarError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UserRef> for String {
    fn from(value: UserRef) -> Self {
        value.to_string()
    }
}

/// A relationship fact: `user` has `relation` on `namespace:object_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTuple {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
    pub user: UserRef,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RelationTuple {
    pub fn new(namespace: &str, object_id: &str, relation: &str, user: UserRef) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.to_string(),
            object_id: object_id.to_string(),
            relation: relation.to_string(),
            user,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.object_id)
    }

    /// Uniqueness key of a live tuple.
    pub fn key(&self) -> TupleKey {
        TupleKey {
            namespace: self.namespace.clone(),
            object_id: self.object_id.clone(),
            relation: self.relation.clone(),
            user: self.user.clone(),
        }
    }
}

impl fmt::Display for RelationTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}",
            self.namespace, self.object_id, self.relation, self.user
        )
    }
}

impl FromStr for RelationTuple {
    type Err = ZanzibarError;

    /// Parses `namespace:object#relation@user`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ZanzibarError::InvalidTuple(s.to_string());

        let (left, user) = s.split_once('@').ok_or_else(invalid)?;
        let (object, relation) = left.split_once('#').ok_or_else(invalid)?;
        let (namespace, object_id) = object.split_once(':').ok_or_else(invalid)?;
        if namespace.is_empty() || object_id.is_empty() || relation.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(namespace, object_id, relation, user.parse()?))
    }
}

/// Identity of a tuple, ignoring timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleKey {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
    pub user: UserRef,
}

/// A single membership question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
    pub user_id: String,
}

impl CheckRequest {
    pub fn new(namespace: &str, object_id: &str, relation: &str, user_id: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            object_id: object_id.to_string(),
            relation: relation.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

impl fmt::Display for CheckRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}",
            self.namespace, self.object_id, self.relation, self.user_id
        )
    }
}

/// A relation on a specific object the user was evaluated against
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
    pub allowed: bool,
}

/// Which rewrite operation produced an expand node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpandOperation {
    /// Entry into `namespace:object#relation`
    Relation,
    This,
    ComputedUserset,
    TupleToUserset,
    Union,
    Intersection,
    Exclusion,
    /// Branch re-entered a relation already on the evaluation path
    Cycle,
    /// Branch hit the depth limit
    Truncated,
}

/// One node of an expanded userset tree.
///
/// `users` always holds the resolved set of concrete identifiers for the
/// subtree, so callers can read any node without walking its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandNode {
    pub operation: ExpandOperation,
    pub target: Option<String>,
    pub users: BTreeSet<String>,
    pub children: Vec<ExpandNode>,
    pub truncated: bool,
}

impl ExpandNode {
    pub fn leaf(operation: ExpandOperation, target: Option<String>) -> Self {
        Self {
            operation,
            target,
            users: BTreeSet::new(),
            children: Vec::new(),
            truncated: matches!(operation, ExpandOperation::Truncated),
        }
    }
}

/// Result of an expand query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandTree {
    pub root: ExpandNode,
    pub truncated: bool,
}

impl ExpandTree {
    /// Flattened set of every identifier that holds the expanded relation.
    pub fn users(&self) -> &BTreeSet<String> {
        &self.root.users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_refs() {
        assert_eq!("user456".parse::<UserRef>().unwrap(), UserRef::user("user456"));
        assert_eq!(
            "folders:root".parse::<UserRef>().unwrap(),
            UserRef::object("folders", "root")
        );
        assert_eq!(
            "group:eng#member".parse::<UserRef>().unwrap(),
            UserRef::userset("group", "eng", "member")
        );

        for bad in ["", "group:#member", ":eng", "group:eng#", "a:b:c", "user 1", "a@b"] {
            assert!(bad.parse::<UserRef>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_tuple_text_form() {
        let tuple: RelationTuple = "groups:eng#member@groups:infra#member".parse().unwrap();
        assert_eq!(tuple.namespace, "groups");
        assert_eq!(tuple.object_id, "eng");
        assert_eq!(tuple.relation, "member");
        assert_eq!(tuple.user, UserRef::userset("groups", "infra", "member"));
        assert_eq!(tuple.to_string(), "groups:eng#member@groups:infra#member");

        assert!("documents:doc1@alice".parse::<RelationTuple>().is_err());
        assert!("documents#owner@alice".parse::<RelationTuple>().is_err());
    }

    #[test]
    fn test_user_ref_serde_uses_text_form() {
        let json = serde_json::to_string(&UserRef::userset("group", "eng", "member")).unwrap();
        assert_eq!(json, "\"group:eng#member\"");
        let back: UserRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UserRef::userset("group", "eng", "member"));
    }
}
