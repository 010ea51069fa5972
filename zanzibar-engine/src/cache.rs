use crate::{
    error::{Result, ZanzibarError},
    store::Revision,
};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, AsyncCommands};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

const REDIS_KEY_PREFIX: &str = "zanzibar:check:";

/// Key of a memoized check decision.
///
/// Covers the query, the tuple revision and the namespace registry version,
/// so an entry can only be reused for the exact snapshot it was computed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_check(
        namespace: &str,
        object_id: &str,
        relation: &str,
        user: &str,
        revision: Revision,
        registry_version: u64,
    ) -> Self {
        let mut hasher = Sha256::new();
        for part in [namespace, object_id, relation, user] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(revision.0.to_be_bytes());
        hasher.update(registry_version.to_be_bytes());
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memoizes check decisions. Failures are reported as `CacheUnavailable`
/// and treated by the engine as misses.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<bool>>;

    async fn put(&self, key: &CacheKey, allowed: bool, ttl: Duration) -> Result<()>;
}

/// Cache that never stores anything
pub struct NoopResultCache;

#[async_trait]
impl ResultCache for NoopResultCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<bool>> {
        Ok(None)
    }

    async fn put(&self, _key: &CacheKey, _allowed: bool, _ttl: Duration) -> Result<()> {
        Ok(())
    }
}

/// Process-local cache with per-entry expiry
pub struct InMemoryResultCache {
    entries: DashMap<CacheKey, (bool, Instant)>,
    max_entries: usize,
}

impl InMemoryResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
    }

    /// Drops the `count` entries closest to expiry
    fn evict_soonest(&self, count: usize) {
        let mut by_expiry: Vec<(Instant, CacheKey)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().1, entry.key().clone()))
            .collect();
        by_expiry.sort_unstable_by_key(|(expires_at, _)| *expires_at);
        for (_, key) in by_expiry.into_iter().take(count) {
            self.entries.remove(&key);
        }
    }
}

impl Default for InMemoryResultCache {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<bool>> {
        let hit = self.entries.get(key).map(|entry| *entry.value());
        match hit {
            Some((allowed, expires_at)) if expires_at > Instant::now() => Ok(Some(allowed)),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &CacheKey, allowed: bool, ttl: Duration) -> Result<()> {
        if self.entries.len() >= self.max_entries {
            self.evict_expired();
            if self.entries.len() >= self.max_entries {
                let count = (self.max_entries / 10).max(1);
                debug!(max_entries = self.max_entries, count, "Result cache full, evicting");
                self.evict_soonest(count);
            }
        }
        self.entries
            .insert(key.clone(), (allowed, Instant::now() + ttl));
        Ok(())
    }
}

/// Redis-backed cache shared between engine instances
pub struct RedisResultCache {
    redis: ConnectionManager,
}

impl RedisResultCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| ZanzibarError::CacheUnavailable(format!("Invalid Redis URL: {}", e)))?;
        let redis = ConnectionManager::new(client).await.map_err(|e| {
            ZanzibarError::CacheUnavailable(format!("Failed to connect to Redis: {}", e))
        })?;
        Ok(Self { redis })
    }

    fn redis_key(key: &CacheKey) -> String {
        format!("{}{}", REDIS_KEY_PREFIX, key)
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<bool>> {
        let mut conn = self.redis.clone();
        let value = conn
            .get::<_, Option<String>>(Self::redis_key(key))
            .await
            .map_err(|e| ZanzibarError::CacheUnavailable(e.to_string()))?;
        Ok(value.map(|v| v == "1"))
    }

    async fn put(&self, key: &CacheKey, allowed: bool, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(
            Self::redis_key(key),
            if allowed { "1" } else { "0" },
            ttl.as_secs().max(1),
        )
        .await
        .map_err(|e| ZanzibarError::CacheUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str, revision: u64) -> CacheKey {
        CacheKey::for_check("documents", "doc1", "viewer", user, Revision(revision), 1)
    }

    #[test]
    fn test_cache_key_covers_snapshot() {
        assert_eq!(key("alice", 1), key("alice", 1));
        assert_ne!(key("alice", 1), key("alice", 2));
        assert_ne!(key("alice", 1), key("bob", 1));
        assert_ne!(
            CacheKey::for_check("documents", "doc1", "viewer", "alice", Revision(1), 2),
            key("alice", 1)
        );
        // Separators keep field boundaries distinct.
        assert_ne!(
            CacheKey::for_check("ab", "c", "r", "u", Revision(1), 1),
            CacheKey::for_check("a", "bc", "r", "u", Revision(1), 1)
        );
        assert_eq!(key("alice", 1).as_str().len(), 64);
    }

    #[tokio::test]
    async fn test_in_memory_cache_expiry() {
        let cache = InMemoryResultCache::default();
        cache.put(&key("alice", 1), true, Duration::from_secs(60)).await.unwrap();
        cache.put(&key("bob", 1), false, Duration::ZERO).await.unwrap();

        assert_eq!(cache.get(&key("alice", 1)).await.unwrap(), Some(true));
        assert_eq!(cache.get(&key("bob", 1)).await.unwrap(), None);
        assert_eq!(cache.get(&key("carol", 1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_memory_cache_is_bounded() {
        let cache = InMemoryResultCache::new(2);
        for (i, user) in ["a", "b", "c"].iter().enumerate() {
            cache
                .put(&key(user, i as u64), true, Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert!(cache.len() <= 2);
    }

    #[tokio::test]
    async fn test_full_cache_evicts_a_slice() {
        let cache = InMemoryResultCache::new(10);
        for i in 0..10u64 {
            cache
                .put(&key("alice", i), true, Duration::from_secs(60 + i))
                .await
                .unwrap();
        }
        cache.put(&key("bob", 0), false, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.len(), 10);
        assert_eq!(cache.get(&key("alice", 0)).await.unwrap(), None);
        for i in 1..10u64 {
            assert_eq!(cache.get(&key("alice", i)).await.unwrap(), Some(true));
        }
        assert_eq!(cache.get(&key("bob", 0)).await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_noop_cache_never_hits() {
        let cache = NoopResultCache;
        cache.put(&key("alice", 1), true, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get(&key("alice", 1)).await.unwrap(), None);
    }
}
