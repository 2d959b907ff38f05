//! moka-backed [`EmbeddingCache`] and [`ResultCache`].
//!
//! Both are bounded by entry count, with a time-to-live applied at
//! insertion. Lookups never fail, so callers never have to fall back to a
//! miss on their account. Result invalidation registers a moka predicate
//! over [`TopicKey`]s, so stale entries are never returned again.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use docsift_core::cache::EmbeddingCache;
use docsift_core::search::{ResultCache, ScoredChunk, TopicKey};

pub struct MokaEmbeddingCache {
    inner: Cache<String, Vec<f32>>,
}

impl MokaEmbeddingCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }
}

#[async_trait]
impl EmbeddingCache for MokaEmbeddingCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>> {
        Ok(self.inner.get(key).await)
    }

    async fn put(&self, key: &str, vector: &[f32]) -> Result<()> {
        self.inner.insert(key.to_string(), vector.to_vec()).await;
        Ok(())
    }
}

pub struct MokaResultCache {
    inner: Cache<TopicKey, Arc<Vec<ScoredChunk>>>,
}

impl MokaResultCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build(),
        }
    }
}

#[async_trait]
impl ResultCache for MokaResultCache {
    async fn get(&self, key: &TopicKey) -> Result<Option<Arc<Vec<ScoredChunk>>>> {
        Ok(self.inner.get(key).await)
    }

    async fn put(&self, key: TopicKey, ranked: Arc<Vec<ScoredChunk>>) -> Result<()> {
        self.inner.insert(key, ranked).await;
        Ok(())
    }

    fn invalidate(&self, library_id: i64, version: &str) -> Result<()> {
        let version = version.to_string();
        self.inner
            .invalidate_entries_if(move |key, _| key.affected_by(library_id, &version))
            .map_err(|e| anyhow!("result cache invalidation failed: {:?}", e))?;
        Ok(())
    }
}
