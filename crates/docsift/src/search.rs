//! Search service: hybrid retrieval plus the popularity side effect.
//!
//! Runs [`docsift_core::search::search_cached`] against the optional
//! result cache and queues the ids of every chunk it returned on the
//! [`AccessWriter`]. The counter update is best-effort: a full buffer or a
//! failed flush never fails the search. Cached hits are counted too.

use anyhow::Result;
use std::sync::Arc;

use docsift_core::embedding::EmbeddingProvider;
use docsift_core::search::{self, ResultCache, SearchPage, SearchParams, SearchRequest};
use docsift_core::store::Store;

use crate::writer::AccessWriter;

pub struct SearchService {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: SearchParams,
    results: Option<Arc<dyn ResultCache>>,
}

impl SearchService {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        params: SearchParams,
        results: Option<Arc<dyn ResultCache>>,
    ) -> Self {
        Self {
            store,
            embedder,
            params,
            results,
        }
    }

    pub async fn search(&self, req: &SearchRequest<'_>, access: &AccessWriter) -> Result<SearchPage> {
        let page = search::search_cached(
            self.store.as_ref(),
            self.embedder.as_ref(),
            self.results.as_deref(),
            &self.params,
            req,
        )
        .await?;
        let mut dropped = 0usize;
        for id in page.chunk_ids() {
            if !access.write(id) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, "access hits dropped");
        }
        Ok(page)
    }
}

/// Print a page of results in human-readable form.
pub fn print_page(page: &SearchPage) {
    if page.results.is_empty() {
        println!("No results.");
        return;
    }
    let first = (page.page - 1) * page.limit;
    for (i, r) in page.results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} (chunk {}, {}, {})",
            first + i as i64 + 1,
            r.score,
            r.title.as_deref().unwrap_or("untitled"),
            r.chunk_id,
            r.version,
            r.chunk_type.as_str(),
        );
        println!(
            "    vector={:.2} lexical={:.2} popularity={:.2}",
            r.scores.vector, r.scores.lexical, r.scores.popularity
        );
        println!("    {}", snippet(&r.text, 200));
        println!();
    }
    println!(
        "page {} · {} of {} results{}",
        page.page,
        page.results.len(),
        page.total,
        if page.has_more { " · more available" } else { "" }
    );
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfig;
    use crate::writer::{AccessSink, BufferedWriter};
    use async_trait::async_trait;
    use docsift_core::cache::MemoryResultCache;
    use docsift_core::models::{ChunkType, NewChunk};
    use docsift_core::store::memory::InMemoryStore;

    struct Axis;

    #[async_trait]
    impl EmbeddingProvider for Axis {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        fn max_batch_size(&self) -> usize {
            8
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn chunk(library_id: i64, index: i64, text: &str) -> NewChunk {
        NewChunk {
            library_id,
            document_upload_id: Some(77),
            version: "1".into(),
            chunk_index: index,
            text: text.into(),
            title: None,
            description: None,
            code: None,
            language: "markdown".into(),
            chunk_type: ChunkType::Info,
            token_count: 3,
            embedding: vec![1.0, 0.0],
            batch_version: 1,
        }
    }

    #[test]
    fn test_snippet_flattens_and_truncates() {
        assert_eq!(snippet("a\n\nb   c", 10), "a b c");
        assert_eq!(snippet("abcdef", 3), "abc...");
    }

    #[tokio::test]
    async fn test_search_bumps_access_counters() {
        let store = Arc::new(InMemoryStore::new());
        let lib = store.create_library("lib").await.unwrap();
        store
            .insert_chunks(&[chunk(lib.id, 0, "alpha beta"), chunk(lib.id, 1, "gamma")])
            .await
            .unwrap();
        store.swap_generation(lib.id, "1", 1, &[77]).await.unwrap();

        let writer: AccessWriter = BufferedWriter::init(
            &WriterConfig::default(),
            Arc::new(AccessSink::new(store.clone())),
        );
        let results = Arc::new(MemoryResultCache::new());
        let service = SearchService::new(
            store.clone(),
            Arc::new(Axis),
            SearchParams::default(),
            Some(results.clone() as Arc<dyn ResultCache>),
        );
        let req = SearchRequest {
            library_id: lib.id,
            query: "alpha",
            version: None,
            mode: None,
            page: 1,
            limit: 0,
        };
        let page = service.search(&req, &writer).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(results.len(), 1);

        let cached = service.search(&req, &writer).await.unwrap();
        assert_eq!(cached.chunk_ids(), page.chunk_ids());
        writer.close().await.unwrap();

        let counts: Vec<i64> = store
            .all_chunks()
            .unwrap()
            .iter()
            .map(|c| c.access_count)
            .collect();
        assert_eq!(counts, vec![2, 2]);
    }
}
