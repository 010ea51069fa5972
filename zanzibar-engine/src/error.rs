use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZanzibarError {
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Relation not found: {namespace}#{relation}")]
    RelationNotFound { namespace: String, relation: String },

    #[error("Invalid rewrite rule for {namespace}#{relation}: {reason}")]
    InvalidRewriteRule {
        namespace: String,
        relation: String,
        reason: String,
    },

    #[error("Invalid user reference: {0}")]
    InvalidUserRef(String),

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Maximum recursion depth of {max_depth} exceeded")]
    MaxDepthExceeded { max_depth: u32 },

    #[error("Consistency token expired")]
    TokenExpired,

    #[error("Consistency token invalid: {0}")]
    TokenInvalid(String),

    #[error("Tuple store unavailable: {0}")]
    TupleStoreUnavailable(String),

    #[error("Result cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ZanzibarError {
    pub fn invalid_rule(namespace: &str, relation: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRewriteRule {
            namespace: namespace.to_string(),
            relation: relation.to_string(),
            reason: reason.into(),
        }
    }

    pub fn relation_not_found(namespace: &str, relation: &str) -> Self {
        Self::RelationNotFound {
            namespace: namespace.to_string(),
            relation: relation.to_string(),
        }
    }

    /// Stable code surfaced to callers of the engine boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NamespaceNotFound(_) => "AUTHZ_NAMESPACE_NOT_FOUND",
            Self::RelationNotFound { .. } => "AUTHZ_RELATION_NOT_FOUND",
            Self::InvalidRewriteRule { .. } => "AUTHZ_INVALID_REWRITE_RULE",
            Self::InvalidUserRef(_) => "AUTHZ_INVALID_USER_REF",
            Self::InvalidTuple(_) => "AUTHZ_INVALID_TUPLE",
            Self::MaxDepthExceeded { .. } => "AUTHZ_MAX_DEPTH_EXCEEDED",
            Self::TokenExpired => "AUTHZ_TOKEN_EXPIRED",
            Self::TokenInvalid(_) => "AUTHZ_TOKEN_INVALID",
            Self::TupleStoreUnavailable(_) => "AUTHZ_STORE_UNAVAILABLE",
            Self::CacheUnavailable(_) => "AUTHZ_CACHE_UNAVAILABLE",
            Self::Timeout { .. } => "AUTHZ_TIMEOUT",
            Self::Configuration(_) => "AUTHZ_CONFIGURATION",
            Self::Internal(_) => "AUTHZ_INTERNAL",
        }
    }

    /// Whether an external caller may retry the same request unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TupleStoreUnavailable(_) | Self::CacheUnavailable(_) | Self::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ZanzibarError>;
