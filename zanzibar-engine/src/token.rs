//! Consistency tokens ("zookies").
//!
//! A token names one revision of the tuple store. Every read made while
//! answering a Check, Expand, ListPermissions or BatchCheck call uses the
//! single revision resolved here.

use crate::{
    error::{Result, ZanzibarError},
    store::{Revision, TupleStore},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

const TOKEN_PREFIX: &str = "zk1";

/// Allowed clock skew for tokens minted by another engine instance
const MAX_CLOCK_SKEW_SECS: i64 = 5;

/// Opaque snapshot marker handed back to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

impl ConsistencyToken {
    pub(crate) fn encode(revision: Revision, issued_at: DateTime<Utc>) -> Self {
        // The opaque string carries milliseconds; keep `issued_at` identical to it.
        let issued_at = Utc
            .timestamp_millis_opt(issued_at.timestamp_millis())
            .single()
            .unwrap_or(issued_at);
        let body = format!(
            "{}.{}.{}",
            TOKEN_PREFIX,
            revision.0,
            issued_at.timestamp_millis()
        );
        let raw = format!("{}.{}", body, checksum(&body));
        Self {
            token: URL_SAFE_NO_PAD.encode(raw),
            issued_at,
        }
    }

    /// Revision and issue time carried inside the opaque string.
    fn decode(&self) -> Result<(Revision, DateTime<Utc>)> {
        let invalid = |reason: &str| ZanzibarError::TokenInvalid(reason.to_string());

        let bytes = URL_SAFE_NO_PAD
            .decode(self.token.as_bytes())
            .map_err(|_| invalid("not base64"))?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid("not utf-8"))?;

        let (body, sum) = raw.rsplit_once('.').ok_or_else(|| invalid("malformed"))?;
        if checksum(body) != sum {
            return Err(invalid("checksum mismatch"));
        }

        let mut parts = body.split('.');
        if parts.next() != Some(TOKEN_PREFIX) {
            return Err(invalid("unknown version"));
        }
        let revision = parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| invalid("bad revision"))?;
        let millis = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(|| invalid("bad timestamp"))?;
        if parts.next().is_some() {
            return Err(invalid("malformed"));
        }

        let issued_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| invalid("bad timestamp"))?;
        Ok((Revision(revision), issued_at))
    }
}

fn checksum(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// A token together with the revision it pins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedToken {
    pub token: ConsistencyToken,
    pub revision: Revision,
}

/// Issues and validates consistency tokens against a tuple store
pub struct ConsistencyTokenManager {
    store: Arc<dyn TupleStore>,
    retention: Duration,
}

impl ConsistencyTokenManager {
    pub fn new(store: Arc<dyn TupleStore>, retention: std::time::Duration) -> Self {
        Self {
            store,
            retention: Duration::from_std(retention).unwrap_or_else(|_| Duration::days(36_500)),
        }
    }

    /// Issues a token for the store's current revision
    pub async fn issue(&self) -> Result<ResolvedToken> {
        let revision = self.store.current_revision().await?;
        let token = ConsistencyToken::encode(revision, Utc::now());
        debug!(%revision, "Issued consistency token");
        Ok(ResolvedToken { token, revision })
    }

    /// Returns the caller's token unchanged if it is still inside the
    /// retention window, or a fresh one when none was supplied.
    pub async fn resolve(&self, token: Option<&ConsistencyToken>) -> Result<ResolvedToken> {
        let Some(token) = token else {
            return self.issue().await;
        };

        let (revision, issued_at) = token.decode()?;
        let now = Utc::now();

        if issued_at > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(ZanzibarError::TokenInvalid("issued in the future".into()));
        }
        if now - issued_at > self.retention {
            return Err(ZanzibarError::TokenExpired);
        }

        let current = self.store.current_revision().await?;
        if revision > current {
            return Err(ZanzibarError::TokenInvalid("unknown revision".into()));
        }

        Ok(ResolvedToken {
            token: token.clone(),
            revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTupleStore;

    fn manager(store: Arc<InMemoryTupleStore>) -> ConsistencyTokenManager {
        ConsistencyTokenManager::new(store, std::time::Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_issue_and_resolve_round_trip() {
        let store = Arc::new(InMemoryTupleStore::new());
        store.write("documents:doc1#owner@alice".parse().unwrap());
        let manager = manager(store.clone());

        let issued = manager.issue().await.unwrap();
        assert_eq!(issued.revision, Revision(1));

        store.write("documents:doc1#owner@bob".parse().unwrap());
        let resolved = manager.resolve(Some(&issued.token)).await.unwrap();
        assert_eq!(resolved.revision, Revision(1));
        assert_eq!(resolved.token.token, issued.token.token);
    }

    #[tokio::test]
    async fn test_resolve_returns_token_unchanged() {
        let store = Arc::new(InMemoryTupleStore::new());
        store.write("documents:doc1#owner@alice".parse().unwrap());
        let manager = manager(store);

        let issued = manager.issue().await.unwrap();
        assert_eq!(issued.token.issued_at.timestamp_subsec_nanos() % 1_000_000, 0);

        let resolved = manager.resolve(Some(&issued.token)).await.unwrap();
        assert_eq!(resolved.token, issued.token);

        let again = manager.resolve(Some(&resolved.token)).await.unwrap();
        assert_eq!(again.token, issued.token);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let store = Arc::new(InMemoryTupleStore::new());
        let manager = manager(store);

        let old = ConsistencyToken::encode(Revision(0), Utc::now() - Duration::minutes(6));
        assert!(matches!(
            manager.resolve(Some(&old)).await,
            Err(ZanzibarError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_invalid_tokens() {
        let store = Arc::new(InMemoryTupleStore::new());
        let manager = manager(store);

        let garbage = ConsistencyToken {
            token: "definitely-not-a-token".into(),
            issued_at: Utc::now(),
        };
        assert!(matches!(
            manager.resolve(Some(&garbage)).await,
            Err(ZanzibarError::TokenInvalid(_))
        ));

        let future_revision = ConsistencyToken::encode(Revision(42), Utc::now());
        assert!(matches!(
            manager.resolve(Some(&future_revision)).await,
            Err(ZanzibarError::TokenInvalid(_))
        ));

        let mut tampered = ConsistencyToken::encode(Revision(0), Utc::now());
        let raw = String::from_utf8(URL_SAFE_NO_PAD.decode(&tampered.token).unwrap()).unwrap();
        tampered.token = URL_SAFE_NO_PAD.encode(raw.replacen("zk1.0.", "zk1.7.", 1));
        assert!(matches!(
            manager.resolve(Some(&tampered)).await,
            Err(ZanzibarError::TokenInvalid(_))
        ));
    }
}
