//! Hybrid retrieval engine: vector + lexical + popularity fusion.
//!
//! The algorithm runs entirely through the [`Store`] and
//! [`EmbeddingProvider`] traits. The calling application supplies
//! [`SearchParams`] (typically from config) and performs the access-counter
//! side effect out of band with [`record_access`].
//!
//! # Scoring
//!
//! 1. Embed the query.
//! 2. Fetch `vector_top_n` candidates by cosine distance and
//!    `lexical_top_n` candidates by term relevance, concurrently.
//! 3. Union by chunk id; a chunk missing from one list scores 0 for it.
//! 4. Normalize: `vector = max(0, 1 - distance)`,
//!    `lexical = raw / max(raw)`, `popularity = access / max(access)`,
//!    both maxima taken over the merged set.
//! 5. `score = w_v × vector + w_l × lexical + w_p × popularity`.
//! 6. Sort by score (desc), then chunk id (asc).
//! 7. Paginate.
//!
//! Either retrieval failing fails the whole search: fused ranking is only
//! meaningful with both signals present.
//!
//! # Topics
//!
//! A query is split on commas into topics ([`split_topics`]). A single
//! topic is ranked as above. Several topics are ranked one by one,
//! concurrently, and the lists are merged with reciprocal rank fusion: a
//! chunk scores `Σ 1 / (RRF_K + rank)` over the lists it appears in, with
//! 1-based ranks.
//!
//! # Result cache
//!
//! [`search_cached`] keeps each topic's ranked list in a [`ResultCache`]
//! keyed by [`TopicKey`]. The indexer drops the entries of a (library,
//! version) pair whenever that pair cuts over to a new generation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::IndexError;
use crate::models::{Chunk, ChunkType};
use crate::store::{ChunkCandidate, ChunkFilter, SearchMode, Store};

/// Rank offset of reciprocal rank fusion.
pub const RRF_K: f64 = 60.0;

/// Relative weights of the three signals. Non-negative; a sum of at most
/// 1.0 keeps fused scores in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionWeights {
    pub vector: f64,
    pub lexical: f64,
    pub popularity: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            lexical: 0.3,
            popularity: 0.2,
        }
    }
}

impl FusionWeights {
    pub fn fuse(&self, scores: &ScoreBreakdown) -> f64 {
        self.vector * scores.vector + self.lexical * scores.lexical + self.popularity * scores.popularity
    }
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Vector candidates to fetch.
    pub vector_top_n: i64,
    /// Lexical candidates to fetch.
    pub lexical_top_n: i64,
    pub weights: FusionWeights,
    /// Page size used when the request asks for `<= 0`.
    pub default_limit: i64,
    /// Upper bound on the page size.
    pub max_limit: i64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            vector_top_n: 50,
            lexical_top_n: 50,
            weights: FusionWeights::default(),
            default_limit: 10,
            max_limit: 50,
        }
    }
}

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub library_id: i64,
    pub query: &'a str,
    /// Restrict to one version of the library.
    pub version: Option<&'a str>,
    pub mode: Option<SearchMode>,
    /// 1-based; values below 1 are treated as 1.
    pub page: i64,
    /// Values `<= 0` mean the default; larger values are clamped.
    pub limit: i64,
}

/// Per-signal normalized scores of one result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub vector: f64,
    pub lexical: f64,
    pub popularity: f64,
}

/// A search candidate after fusion. Lives only for one search call.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub scores: ScoreBreakdown,
    pub score: f64,
}

/// One result row.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub chunk_id: i64,
    pub library_id: i64,
    pub document_upload_id: Option<i64>,
    pub version: String,
    pub title: Option<String>,
    pub text: String,
    pub code: Option<String>,
    pub language: String,
    pub chunk_type: ChunkType,
    pub token_count: i64,
    pub access_count: i64,
    /// Fused relevance score.
    pub score: f64,
    pub scores: ScoreBreakdown,
}

impl From<ScoredChunk> for SearchResultItem {
    fn from(s: ScoredChunk) -> Self {
        let c = s.chunk;
        Self {
            chunk_id: c.id,
            library_id: c.library_id,
            document_upload_id: c.document_upload_id,
            version: c.version,
            title: c.title,
            text: c.text,
            code: c.code,
            language: c.language,
            chunk_type: c.chunk_type,
            token_count: c.token_count,
            access_count: c.access_count,
            score: s.score,
            scores: s.scores,
        }
    }
}

/// A ranked page of results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub results: Vec<SearchResultItem>,
    /// Size of the full ranked list.
    pub total: usize,
    pub page: i64,
    pub limit: i64,
    pub has_more: bool,
}

impl SearchPage {
    pub fn chunk_ids(&self) -> Vec<i64> {
        self.results.iter().map(|r| r.chunk_id).collect()
    }
}

/// Identifies the ranked list of one topic under one request scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    pub library_id: i64,
    /// `None` for a search across every version.
    pub version: Option<String>,
    pub mode: Option<SearchMode>,
    pub topic: String,
}

impl TopicKey {
    pub fn new(req: &SearchRequest<'_>, topic: &str) -> Self {
        Self {
            library_id: req.library_id,
            version: req.version.map(str::to_string),
            mode: req.mode,
            topic: topic.to_string(),
        }
    }

    /// Whether a cutover of (`library_id`, `version`) can change this list.
    pub fn affected_by(&self, library_id: i64, version: &str) -> bool {
        self.library_id == library_id && self.version.as_deref().map_or(true, |v| v == version)
    }
}

/// Store of per-topic ranked lists. Implementations own capacity and expiry.
///
/// The cache is advisory: a failing read is treated as a miss and a
/// failing write is ignored.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &TopicKey) -> Result<Option<Arc<Vec<ScoredChunk>>>>;
    async fn put(&self, key: TopicKey, ranked: Arc<Vec<ScoredChunk>>) -> Result<()>;
    /// Drop every entry that a cutover of (`library_id`, `version`) made stale.
    fn invalidate(&self, library_id: i64, version: &str) -> Result<()>;
}

/// Comma-separated topics of a query, trimmed, blanks dropped.
pub fn split_topics(query: &str) -> Vec<&str> {
    query
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Run a hybrid search without a result cache.
///
/// Fails with [`IndexError::InvalidParams`] for a blank query and
/// [`IndexError::NotFound`] for an unknown library. Does not touch access
/// counters; see [`record_access`].
pub async fn search(
    store: &dyn Store,
    embedder: &dyn EmbeddingProvider,
    params: &SearchParams,
    req: &SearchRequest<'_>,
) -> Result<SearchPage> {
    search_cached(store, embedder, None, params, req).await
}

/// Run a hybrid search, serving topic rankings from `cache` when present.
pub async fn search_cached(
    store: &dyn Store,
    embedder: &dyn EmbeddingProvider,
    cache: Option<&dyn ResultCache>,
    params: &SearchParams,
    req: &SearchRequest<'_>,
) -> Result<SearchPage> {
    let topics = split_topics(req.query);
    if topics.is_empty() {
        return Err(IndexError::InvalidParams("query must not be empty".into()).into());
    }
    if store.get_library(req.library_id).await?.is_none() {
        return Err(IndexError::NotFound(format!("library {}", req.library_id)).into());
    }

    let ranked = match topics.as_slice() {
        [topic] => rank_topic_cached(store, embedder, cache, params, req, topic).await?,
        _ => {
            let lists = futures::future::try_join_all(
                topics
                    .iter()
                    .map(|topic| rank_topic_cached(store, embedder, cache, params, req, topic)),
            )
            .await?;
            debug!(topics = lists.len(), "merging topic rankings");
            Arc::new(reciprocal_rank_fusion(&lists))
        }
    };
    Ok(paginate(&ranked, req.page, req.limit, params))
}

async fn rank_topic_cached(
    store: &dyn Store,
    embedder: &dyn EmbeddingProvider,
    cache: Option<&dyn ResultCache>,
    params: &SearchParams,
    req: &SearchRequest<'_>,
    topic: &str,
) -> Result<Arc<Vec<ScoredChunk>>> {
    let Some(cache) = cache else {
        return Ok(Arc::new(rank_topic(store, embedder, params, req, topic).await?));
    };

    let key = TopicKey::new(req, topic);
    match cache.get(&key).await {
        Ok(Some(hit)) => {
            debug!(topic, "result cache hit");
            return Ok(hit);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "result cache read failed"),
    }

    let ranked = Arc::new(rank_topic(store, embedder, params, req, topic).await?);
    if let Err(e) = cache.put(key, ranked.clone()).await {
        warn!(error = %e, "result cache write failed");
    }
    Ok(ranked)
}

/// Retrieve and fuse candidates for one topic.
async fn rank_topic(
    store: &dyn Store,
    embedder: &dyn EmbeddingProvider,
    params: &SearchParams,
    req: &SearchRequest<'_>,
    topic: &str,
) -> Result<Vec<ScoredChunk>> {
    let query_vec = embedder.embed(topic).await?;

    let filter = ChunkFilter {
        library_id: req.library_id,
        version: req.version.map(str::to_string),
        mode: req.mode,
    };
    let (vector, lexical) = futures::try_join!(
        store.vector_search(&query_vec, &filter, params.vector_top_n),
        store.lexical_search(topic, &filter, params.lexical_top_n),
    )?;
    debug!(
        topic,
        vector = vector.len(),
        lexical = lexical.len(),
        "retrieved candidates"
    );

    Ok(rank_candidates(vector, lexical, &params.weights))
}

/// Merge ranked lists by reciprocal rank fusion.
///
/// A chunk keeps the signal breakdown of its first appearance; its score
/// becomes the fused rank score. Sorted by score (desc), then chunk id (asc).
pub fn reciprocal_rank_fusion(lists: &[Arc<Vec<ScoredChunk>>]) -> Vec<ScoredChunk> {
    let mut fused: HashMap<i64, ScoredChunk> = HashMap::new();
    for list in lists {
        for (rank, scored) in list.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + rank as f64 + 1.0);
            fused
                .entry(scored.chunk.id)
                .or_insert_with(|| ScoredChunk {
                    score: 0.0,
                    ..scored.clone()
                })
                .score += contribution;
        }
    }

    let mut merged: Vec<ScoredChunk> = fused.into_values().collect();
    merged.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.chunk.id.cmp(&b.chunk.id)));
    merged
}

/// Best-effort popularity update for the chunks a page returned.
pub async fn record_access(store: &dyn Store, page: &SearchPage) -> Result<()> {
    let ids = page.chunk_ids();
    if ids.is_empty() {
        return Ok(());
    }
    store.increment_access(&ids).await
}

/// Merge, normalize, fuse, and sort candidates.
pub fn rank_candidates(
    vector: Vec<ChunkCandidate>,
    lexical: Vec<ChunkCandidate>,
    weights: &FusionWeights,
) -> Vec<ScoredChunk> {
    let mut merged: HashMap<i64, ScoredChunk> = HashMap::new();

    for cand in vector {
        let similarity = (1.0 - cand.raw_score).max(0.0);
        merged
            .entry(cand.chunk.id)
            .or_insert_with(|| unscored(cand.chunk))
            .scores
            .vector = similarity;
    }

    let max_lexical = lexical.iter().map(|c| c.raw_score).fold(0.0, f64::max);
    for cand in lexical {
        let normalized = if max_lexical > 0.0 {
            cand.raw_score / max_lexical
        } else {
            0.0
        };
        merged
            .entry(cand.chunk.id)
            .or_insert_with(|| unscored(cand.chunk))
            .scores
            .lexical = normalized;
    }

    let max_access = merged
        .values()
        .map(|s| s.chunk.access_count)
        .max()
        .unwrap_or(0);
    let access_denominator = if max_access > 0 { max_access as f64 } else { 1.0 };

    let mut ranked: Vec<ScoredChunk> = merged
        .into_values()
        .map(|mut s| {
            s.scores.popularity = s.chunk.access_count.max(0) as f64 / access_denominator;
            s.score = weights.fuse(&s.scores);
            s
        })
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.chunk.id.cmp(&b.chunk.id)));
    ranked
}

fn unscored(chunk: Chunk) -> ScoredChunk {
    ScoredChunk {
        chunk,
        scores: ScoreBreakdown::default(),
        score: 0.0,
    }
}

/// Cut one page out of a ranked list.
pub fn paginate(ranked: &[ScoredChunk], page: i64, limit: i64, params: &SearchParams) -> SearchPage {
    let limit = if limit <= 0 { params.default_limit } else { limit }.clamp(1, params.max_limit.max(1));
    let page = page.max(1);
    let total = ranked.len();
    let start = ((page - 1).saturating_mul(limit)).min(total as i64) as usize;

    let results: Vec<SearchResultItem> = ranked
        .iter()
        .skip(start)
        .take(limit as usize)
        .cloned()
        .map(SearchResultItem::from)
        .collect();

    SearchPage {
        results,
        total,
        page,
        limit,
        has_more: page.saturating_mul(limit) < total as i64,
    }
}
