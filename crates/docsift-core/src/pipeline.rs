//! Indexing pipeline: parse → chunk → embed → persist → cut over.
//!
//! [`Indexer::ingest_upload`] indexes one document as a new generation of
//! its chunks; [`Indexer::refresh_version`] re-indexes every document of a
//! (library, version) pair under a single new batch version and swaps the
//! whole pair over at once.
//!
//! Steps run strictly in sequence and nothing is rolled back: an embedding
//! call that succeeded stays paid for even if a later write fails. Chunks are
//! always written `pending` and only become searchable through
//! [`Store::swap_generation`], so a failure at any step leaves the previous
//! generation fully active and the partial one orphaned for
//! [`Store::collect_garbage`]. Every successful cutover drops the cached
//! search results of its (library, version) pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use crate::chunk::chunk_text;
use crate::embedding::{embed_all, EmbeddingProvider};
use crate::error::IndexError;
use crate::models::{ChunkDraft, DocumentUpload, FileType, NewChunk, UploadStatus};
use crate::parse::{extract_text, parse_document, preprocess};
use crate::progress::{IngestEvent, ProgressSink, Stage};
use crate::search::ResultCache;
use crate::storage::BlobStorage;
use crate::store::{Store, SwapOutcome};

/// Chunking and write tuning for the pipeline.
#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    /// Rows per `insert_chunks` call.
    pub write_batch_size: usize,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_tokens: 0,
            write_batch_size: 100,
        }
    }
}

/// Result of a successful [`Indexer::ingest_upload`].
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub upload_id: i64,
    pub batch_version: i64,
    pub chunk_count: i64,
    pub token_count: i64,
}

/// Result of a successful [`Indexer::refresh_version`].
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub batch_version: i64,
    /// Upload ids whose new generation went live.
    pub succeeded: Vec<i64>,
    /// Upload ids that failed, with their error. Their previous chunks stay active.
    pub failed: Vec<(i64, String)>,
    pub swap: SwapOutcome,
    /// Rows removed by the garbage collection pass after the swap.
    pub collected: u64,
}

/// Counts for one document's freshly written generation.
#[derive(Debug, Clone, Copy)]
struct GenerationStats {
    chunk_count: i64,
    token_count: i64,
}

/// Parse and chunk raw bytes without touching any backend.
pub fn prepare_chunks(
    bytes: &[u8],
    file_type: FileType,
    options: &IndexerOptions,
) -> Result<Vec<ChunkDraft>> {
    let text = parse_document(bytes, file_type)?;
    Ok(chunk_text(&text, options.max_tokens, options.overlap_tokens))
}

/// Drives documents through the pipeline against pluggable backends.
pub struct Indexer {
    store: Arc<dyn Store>,
    storage: Arc<dyn BlobStorage>,
    embedder: Arc<dyn EmbeddingProvider>,
    options: IndexerOptions,
    results: Option<Arc<dyn ResultCache>>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn BlobStorage>,
        embedder: Arc<dyn EmbeddingProvider>,
        options: IndexerOptions,
    ) -> Self {
        Self {
            store,
            storage,
            embedder,
            options,
            results: None,
        }
    }

    /// Invalidate `cache` on every cutover this indexer performs.
    pub fn with_result_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.results = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Drop cached search results covering (library, version).
    pub fn invalidate_results(&self, library_id: i64, version: &str) {
        if let Some(cache) = &self.results {
            if let Err(e) = cache.invalidate(library_id, version) {
                warn!(library_id, version, error = %e, "result cache invalidation failed");
            }
        }
    }

    /// Index one upload as a new generation of its chunks.
    ///
    /// Moves the upload `processing -> completed`, or to `failed` with the
    /// error message when any step fails. No automatic retry.
    pub async fn ingest_upload(&self, upload_id: i64, sink: &dyn ProgressSink) -> Result<IngestOutcome> {
        let upload = match self.store.get_upload(upload_id).await? {
            Some(u) if u.status != UploadStatus::Deleted => u,
            _ => return Err(IndexError::NotFound(format!("upload {}", upload_id)).into()),
        };

        self.store
            .set_upload_status(upload.id, UploadStatus::Processing, None)
            .await?;

        match self.ingest_generation(&upload, sink).await {
            Ok(outcome) => {
                info!(
                    upload_id = upload.id,
                    chunks = outcome.chunk_count,
                    tokens = outcome.token_count,
                    batch_version = outcome.batch_version,
                    "document indexed"
                );
                sink.report(IngestEvent::Completed {
                    upload_id: upload.id,
                    chunk_count: outcome.chunk_count,
                    token_count: outcome.token_count,
                });
                Ok(outcome)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(upload_id = upload.id, error = %message, "document indexing failed");
                self.mark_failed(upload.id, &message).await;
                sink.report(IngestEvent::Failed {
                    upload_id: upload.id,
                    error: message,
                });
                Err(e)
            }
        }
    }

    async fn ingest_generation(
        &self,
        upload: &DocumentUpload,
        sink: &dyn ProgressSink,
    ) -> Result<IngestOutcome> {
        let batch_version = self
            .store
            .next_batch_version(upload.library_id, &upload.version)
            .await?;
        let stats = self.build_generation(upload, batch_version, sink).await?;
        let swap = self
            .store
            .swap_generation(upload.library_id, &upload.version, batch_version, &[upload.id])
            .await?;
        debug!(upload_id = upload.id, ?swap, "generation swapped");
        self.invalidate_results(upload.library_id, &upload.version);
        self.store
            .complete_upload(upload.id, stats.chunk_count, stats.token_count)
            .await?;

        Ok(IngestOutcome {
            upload_id: upload.id,
            batch_version: swap.batch_version,
            chunk_count: stats.chunk_count,
            token_count: stats.token_count,
        })
    }

    /// Re-index every document of (library, version) and cut over at once.
    ///
    /// Documents are processed one at a time under one batch version. A
    /// document that fails is marked `failed` and keeps its previous chunks;
    /// the others still go live. If none succeeds, nothing is swapped.
    /// `cancel` is checked before each document; a cancelled refresh
    /// leaves the previous generation untouched.
    pub async fn refresh_version(
        &self,
        library_id: i64,
        version: &str,
        sink: &dyn ProgressSink,
        cancel: Option<&AtomicBool>,
    ) -> Result<RefreshOutcome> {
        match self.refresh_inner(library_id, version, sink, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                sink.report(IngestEvent::RefreshFailed {
                    error: format!("{:#}", e),
                });
                Err(e)
            }
        }
    }

    async fn refresh_inner(
        &self,
        library_id: i64,
        version: &str,
        sink: &dyn ProgressSink,
        cancel: Option<&AtomicBool>,
    ) -> Result<RefreshOutcome> {
        if self.store.get_library(library_id).await?.is_none() {
            return Err(IndexError::NotFound(format!("library {}", library_id)).into());
        }
        let uploads = self.store.list_uploads(library_id, version).await?;
        if uploads.is_empty() {
            return Err(IndexError::NotFound(format!(
                "no documents in library {} version {}",
                library_id, version
            ))
            .into());
        }

        let total = uploads.len();
        sink.report(IngestEvent::RefreshStarted {
            library_id,
            version: version.to_string(),
            total,
        });
        let batch_version = self.store.next_batch_version(library_id, version).await?;
        info!(library_id, version, batch_version, total, "refresh started");

        let mut succeeded: Vec<(&DocumentUpload, GenerationStats)> = Vec::new();
        let mut failed: Vec<(i64, String)> = Vec::new();

        for (i, upload) in uploads.iter().enumerate() {
            let current = i + 1;
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                self.abandon(&succeeded).await;
                bail!(
                    "refresh of library {} version {} cancelled after {} of {} documents",
                    library_id,
                    version,
                    i,
                    total
                );
            }

            sink.report(IngestEvent::DocumentStarted {
                upload_id: upload.id,
                current,
                total,
                title: upload.title.clone(),
            });
            self.store
                .set_upload_status(upload.id, UploadStatus::Processing, None)
                .await?;

            match self.build_generation(upload, batch_version, sink).await {
                Ok(stats) => {
                    sink.report(IngestEvent::DocumentCompleted {
                        upload_id: upload.id,
                        current,
                        total,
                        chunk_count: stats.chunk_count,
                    });
                    succeeded.push((upload, stats));
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(upload_id = upload.id, error = %message, "refresh: document failed");
                    self.mark_failed(upload.id, &message).await;
                    sink.report(IngestEvent::DocumentFailed {
                        upload_id: upload.id,
                        current,
                        total,
                        error: message.clone(),
                    });
                    failed.push((upload.id, message));
                }
            }
        }

        if succeeded.is_empty() {
            bail!(
                "refresh of library {} version {} failed: all {} documents failed",
                library_id,
                version,
                total
            );
        }

        sink.report(IngestEvent::Switching { batch_version });
        let ids: Vec<i64> = succeeded.iter().map(|(u, _)| u.id).collect();
        let swap = match self
            .store
            .swap_generation(library_id, version, batch_version, &ids)
            .await
        {
            Ok(swap) => swap,
            Err(e) => {
                let message = format!("generation swap failed: {:#}", e);
                for id in &ids {
                    self.mark_failed(*id, &message).await;
                }
                return Err(e);
            }
        };
        self.invalidate_results(library_id, version);

        for (upload, stats) in &succeeded {
            self.store
                .complete_upload(upload.id, stats.chunk_count, stats.token_count)
                .await?;
        }

        let collected = match self.store.collect_garbage().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "garbage collection after refresh failed");
                0
            }
        };

        info!(
            library_id,
            version,
            batch_version = swap.batch_version,
            succeeded = ids.len(),
            failed = failed.len(),
            "refresh completed"
        );
        sink.report(IngestEvent::RefreshCompleted {
            batch_version: swap.batch_version,
            succeeded: ids.len(),
            failed: failed.len(),
        });

        Ok(RefreshOutcome {
            batch_version: swap.batch_version,
            succeeded: ids,
            failed,
            swap,
            collected,
        })
    }

    /// Parse, chunk, embed, and write one document's chunks as `pending`
    /// rows of `batch_version`.
    async fn build_generation(
        &self,
        upload: &DocumentUpload,
        batch_version: i64,
        sink: &dyn ProgressSink,
    ) -> Result<GenerationStats> {
        let id = upload.id;

        sink.report(IngestEvent::stage(id, Stage::Parsing, upload.filename.clone()));
        let bytes = self.storage.download(&upload.storage_key).await?;
        let text = extract_text(&bytes, upload.file_type)?;

        sink.report(IngestEvent::stage(id, Stage::Preprocessing, format!("{} bytes", bytes.len())));
        let text = preprocess(text, upload.file_type);

        sink.report(IngestEvent::stage(id, Stage::Chunking, ""));
        let drafts = chunk_text(&text, self.options.max_tokens, self.options.overlap_tokens);
        debug!(upload_id = id, chunks = drafts.len(), "chunked");

        sink.report(IngestEvent::stage(id, Stage::Embedding, format!("{} chunks", drafts.len())));
        let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let vectors = embed_all(self.embedder.as_ref(), &texts).await?;

        sink.report(IngestEvent::stage(id, Stage::Saving, format!("{} chunks", drafts.len())));
        let default_language = upload.file_type.default_language();
        let rows: Vec<NewChunk> = drafts
            .into_iter()
            .zip(vectors)
            .map(|(draft, embedding)| NewChunk {
                library_id: upload.library_id,
                document_upload_id: Some(id),
                version: upload.version.clone(),
                chunk_index: draft.index as i64,
                title: draft.title,
                description: None,
                code: draft.code,
                language: draft
                    .language
                    .unwrap_or_else(|| default_language.to_string()),
                chunk_type: draft.chunk_type,
                token_count: draft.token_count as i64,
                text: draft.text,
                embedding,
                batch_version,
            })
            .collect();

        for batch in rows.chunks(self.options.write_batch_size.max(1)) {
            self.store.insert_chunks(batch).await?;
        }

        Ok(GenerationStats {
            chunk_count: rows.len() as i64,
            token_count: rows.iter().map(|r| r.token_count).sum(),
        })
    }

    async fn mark_failed(&self, upload_id: i64, message: &str) {
        if let Err(e) = self
            .store
            .set_upload_status(upload_id, UploadStatus::Failed, Some(message))
            .await
        {
            warn!(upload_id, error = %e, "could not record upload failure");
        }
    }

    /// Restore the status of documents processed by a cancelled refresh and
    /// drop their pending rows.
    async fn abandon(&self, processed: &[(&DocumentUpload, GenerationStats)]) {
        for (upload, _) in processed {
            if let Err(e) = self
                .store
                .set_upload_status(upload.id, upload.status, upload.error_message.as_deref())
                .await
            {
                warn!(upload_id = upload.id, error = %e, "could not restore upload status");
            }
        }
        if let Err(e) = self.store.collect_garbage().await {
            warn!(error = %e, "garbage collection after cancelled refresh failed");
        }
    }
}
