//! Optional query-result cache.
//!
//! The pipeline consults a [`QueryCache`] before embedding a question and
//! stores the ranked top-k afterwards. Expiry belongs to the cache. Keys carry
//! the index epoch and generation, so a result computed before an ingest or a
//! clear can never be served after it. [`InMemoryQueryCache`] bounds entries by
//! count and age; eviction of the oldest entries is approximate.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use mini_moka::sync::Cache;

use crate::document::{QueryResult, UserId};

/// Identifies one cached retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: UserId,
    /// [`UserIndex::epoch`](crate::UserIndex::epoch) of the queried index.
    pub epoch: u64,
    /// [`UserIndex::generation`](crate::UserIndex::generation) at query time.
    pub generation: u64,
    pub question: String,
    pub k: usize,
    pub document_id: Option<String>,
}

/// Key → ranked results store.
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<QueryResult>;

    async fn put(&self, key: CacheKey, result: QueryResult);
}

/// In-process cache with a fixed time-to-live and entry cap.
#[derive(Clone)]
pub struct InMemoryQueryCache {
    ttl: Duration,
    capacity: u64,
    entries: Cache<CacheKey, QueryResult>,
}

impl InMemoryQueryCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1) as u64;
        Self {
            ttl,
            capacity,
            entries: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
        }
    }

    /// Drop every cached result.
    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }
}

impl fmt::Debug for InMemoryQueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryQueryCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

#[async_trait]
impl QueryCache for InMemoryQueryCache {
    async fn get(&self, key: &CacheKey) -> Option<QueryResult> {
        self.entries.get(key)
    }

    async fn put(&self, key: CacheKey, result: QueryResult) {
        self.entries.insert(key, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(question: &str) -> CacheKey {
        CacheKey {
            user_id: UserId::new("alice").unwrap(),
            epoch: 1,
            generation: 1,
            question: question.to_string(),
            k: 3,
            document_id: None,
        }
    }

    #[tokio::test]
    async fn returns_what_was_put() {
        let cache = InMemoryQueryCache::new(Duration::from_secs(60), 10);
        assert!(cache.get(&key("q")).await.is_none());
        cache.put(key("q"), Vec::new()).await;
        assert_eq!(cache.get(&key("q")).await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryQueryCache::new(Duration::from_millis(50), 10);
        cache.put(key("q"), Vec::new()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get(&key("q")).await.is_none());
    }

    #[tokio::test]
    async fn different_generation_is_a_miss() {
        let cache = InMemoryQueryCache::new(Duration::from_secs(60), 10);
        cache.put(key("q"), Vec::new()).await;
        let mut later = key("q");
        later.generation += 1;
        assert!(cache.get(&later).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_all_empties_the_cache() {
        let cache = InMemoryQueryCache::new(Duration::from_secs(60), 10);
        cache.put(key("q"), Vec::new()).await;
        cache.invalidate_all();
        assert!(cache.get(&key("q")).await.is_none());
    }
}
