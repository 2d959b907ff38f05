//! Content-addressed embedding cache.
//!
//! [`CachedEmbedder`] wraps any [`EmbeddingProvider`] and consults an
//! [`EmbeddingCache`] before calling it. Keys are derived from the text
//! alone ([`cache_key`]), so identical text hits the same entry no matter
//! where it came from. Batches are checked per item: only misses are sent
//! to the provider and results are spliced back into input order.
//!
//! The cache is advisory. A failing cache read is treated as a miss and a
//! failing write is ignored; neither fails the embedding call.
//!
//! [`MemoryResultCache`] is the in-process [`ResultCache`] for ranked
//! search lists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::embedding::{check_batch, check_response, EmbeddingProvider};
use crate::search::{ResultCache, ScoredChunk, TopicKey};

const KEY_PREFIX: &str = "embedding:query:";

/// Reference time-to-live for cached vectors.
pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;

/// Cache key for `text`: a fixed prefix plus the hex SHA-256 of the text.
pub fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{}{:x}", KEY_PREFIX, hasher.finalize())
}

/// Key/value store for embedding vectors. Implementations own expiry.
#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>>;
    async fn put(&self, key: &str, vector: &[f32]) -> Result<()>;
}

/// In-process cache with a fixed TTL.
pub struct MemoryEmbeddingCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Vec<f32>, DateTime<Utc>)>>,
}

impl MemoryEmbeddingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryEmbeddingCache {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_TTL_SECS))
    }
}

#[async_trait]
impl EmbeddingCache for MemoryEmbeddingCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("embedding cache lock poisoned"))?;
        match entries.get(key) {
            Some((vector, expires_at)) if *expires_at > Utc::now() => Ok(Some(vector.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, vector: &[f32]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("embedding cache lock poisoned"))?;
        entries.insert(key.to_string(), (vector.to_vec(), Utc::now() + self.ttl));
        Ok(())
    }
}

/// An [`EmbeddingProvider`] that serves repeated texts from a cache.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn EmbeddingCache>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, cache: Arc<dyn EmbeddingCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        check_batch(texts, self.max_batch_size())?;

        let keys: Vec<String> = texts.iter().map(|t| cache_key(t)).collect();
        let mut slots: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        for key in &keys {
            let hit = match self.cache.get(key).await {
                Ok(hit) => hit,
                Err(e) => {
                    warn!(error = %e, "embedding cache read failed, treating as miss");
                    None
                }
            };
            slots.push(hit);
        }

        let miss_idx: Vec<usize> = (0..texts.len()).filter(|i| slots[*i].is_none()).collect();
        debug!(
            total = texts.len(),
            misses = miss_idx.len(),
            "embedding cache lookup"
        );

        if !miss_idx.is_empty() {
            let miss_texts: Vec<String> = miss_idx.iter().map(|i| texts[*i].clone()).collect();
            let fresh = self.inner.embed_batch(&miss_texts).await?;
            check_response(miss_texts.len(), &fresh)?;

            for (i, vector) in miss_idx.into_iter().zip(fresh) {
                if let Err(e) = self.cache.put(&keys[i], &vector).await {
                    warn!(error = %e, "embedding cache write failed");
                }
                slots[i] = Some(vector);
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| anyhow!("embedding missing after cache splice")))
            .collect()
    }
}

/// Unbounded in-process [`ResultCache`]; entries live until invalidated.
#[derive(Default)]
pub struct MemoryResultCache {
    entries: Mutex<HashMap<TopicKey, Arc<Vec<ScoredChunk>>>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &TopicKey) -> Result<Option<Arc<Vec<ScoredChunk>>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("result cache lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: TopicKey, ranked: Arc<Vec<ScoredChunk>>) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("result cache lock poisoned"))?
            .insert(key, ranked);
        Ok(())
    }

    fn invalidate(&self, library_id: i64, version: &str) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("result cache lock poisoned"))?
            .retain(|key, _| !key.affected_by(library_id, version));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbedError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        texts_seen: Mutex<Vec<String>>,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        fn max_batch_size(&self) -> usize {
            8
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            check_batch(texts, 8)?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_seen.lock().unwrap().extend(texts.iter().cloned());
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, t.bytes().map(|b| b as f32).sum()])
                .collect())
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl EmbeddingCache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<Vec<f32>>> {
            Err(anyhow!("connection refused"))
        }
        async fn put(&self, _key: &str, _vector: &[f32]) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    fn cached(provider: Arc<CountingProvider>) -> CachedEmbedder {
        CachedEmbedder::new(provider, Arc::new(MemoryEmbeddingCache::default()))
    }

    #[test]
    fn test_cache_key_is_content_hash() {
        assert_eq!(cache_key("auth"), cache_key("auth"));
        assert_ne!(cache_key("auth"), cache_key("Auth"));
        assert!(cache_key("auth").starts_with("embedding:query:"));
        assert_eq!(cache_key("auth").len(), "embedding:query:".len() + 64);
    }

    #[tokio::test]
    async fn test_repeat_embed_hits_cache() {
        let provider = Arc::new(CountingProvider::new());
        let embedder = cached(provider.clone());

        let first = embedder.embed("how do I authenticate").await.unwrap();
        let second = embedder.embed("how do I authenticate").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_sends_only_misses_and_keeps_order() {
        let provider = Arc::new(CountingProvider::new());
        let embedder = cached(provider.clone());

        embedder.embed("beta").await.unwrap();
        let texts: Vec<String> = ["alpha", "beta", "gamma"].iter().map(|s| s.to_string()).collect();
        let vectors = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0][0], 5.0);
        assert_eq!(vectors[1][0], 4.0);
        assert_eq!(vectors[2][0], 5.0);
        assert_ne!(vectors[0], vectors[2]);
        assert_eq!(
            *provider.texts_seen.lock().unwrap(),
            vec!["beta".to_string(), "alpha".to_string(), "gamma".to_string()]
        );
    }

    #[tokio::test]
    async fn test_full_hit_batch_skips_provider() {
        let provider = Arc::new(CountingProvider::new());
        let embedder = cached(provider.clone());
        let texts = vec!["one".to_string(), "two".to_string()];
        embedder.embed_batch(&texts).await.unwrap();
        embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_outage_degrades_to_miss() {
        let provider = Arc::new(CountingProvider::new());
        let embedder = CachedEmbedder::new(provider.clone(), Arc::new(BrokenCache));
        embedder.embed("query").await.unwrap();
        embedder.embed("query").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_entries_miss() {
        let provider = Arc::new(CountingProvider::new());
        let embedder = CachedEmbedder::new(
            provider.clone(),
            Arc::new(MemoryEmbeddingCache::new(Duration::zero())),
        );
        embedder.embed("query").await.unwrap();
        embedder.embed("query").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_result_cache_invalidates_matching_scope() {
        let cache = MemoryResultCache::new();
        let key = |library_id, version: Option<&str>| TopicKey {
            library_id,
            version: version.map(str::to_string),
            mode: None,
            topic: "routing".into(),
        };
        for k in [key(1, Some("1.0")), key(1, Some("2.0")), key(1, None), key(2, Some("1.0"))] {
            cache.put(k, Arc::new(Vec::new())).await.unwrap();
        }

        cache.invalidate(1, "1.0").unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(1, Some("1.0"))).await.unwrap().is_none());
        assert!(cache.get(&key(1, None)).await.unwrap().is_none());
        assert!(cache.get(&key(1, Some("2.0"))).await.unwrap().is_some());
        assert!(cache.get(&key(2, Some("1.0"))).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_contract_errors_pass_through() {
        let provider = Arc::new(CountingProvider::new());
        let embedder = cached(provider.clone());
        let err = embedder.embed_batch(&[]).await.unwrap_err();
        assert_eq!(err.downcast_ref::<EmbedError>(), Some(&EmbedError::EmptyInput));

        let too_many: Vec<String> = (0..9).map(|i| format!("t{}", i)).collect();
        let err = embedder.embed_batch(&too_many).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<EmbedError>(),
            Some(&EmbedError::BatchTooLarge { size: 9, max: 8 })
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
