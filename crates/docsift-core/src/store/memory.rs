//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! All state sits behind a single `RwLock`, so every trait method,
//! including [`Store::swap_generation`], is atomic with respect to readers.
//! Vector search is brute-force cosine distance; lexical search sums term
//! frequencies over chunks that contain every query term.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::error::IndexError;
use crate::models::{
    Chunk, ChunkStatus, DocumentUpload, Library, NewChunk, NewUpload, UploadStatus,
};

use super::{query_terms, ChunkCandidate, ChunkFilter, IndexStats, Store, SwapOutcome};

struct StoredChunk {
    chunk: Chunk,
    embedding: Vec<f32>,
}

#[derive(Default)]
struct Inner {
    libraries: Vec<Library>,
    uploads: BTreeMap<i64, DocumentUpload>,
    chunks: Vec<StoredChunk>,
    batch_counters: HashMap<(i64, String), i64>,
    next_library_id: i64,
    next_upload_id: i64,
    next_chunk_id: i64,
}

impl Inner {
    fn allocate_batch(&mut self, library_id: i64, version: &str, at_least: i64) -> i64 {
        let counter = self
            .batch_counters
            .entry((library_id, version.to_string()))
            .or_insert(0);
        *counter = (*counter).max(at_least) + 1;
        *counter
    }

    fn in_pair<'a>(
        &'a mut self,
        library_id: i64,
        version: &'a str,
    ) -> impl Iterator<Item = &'a mut Chunk> + 'a {
        self.chunks
            .iter_mut()
            .map(|sc| &mut sc.chunk)
            .filter(move |c| c.library_id == library_id && c.version == version)
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    /// Every chunk row regardless of status, in insertion order.
    pub fn all_chunks(&self) -> Result<Vec<Chunk>> {
        Ok(self.read()?.chunks.iter().map(|sc| sc.chunk.clone()).collect())
    }

    /// Overwrite a chunk's access counter.
    pub fn set_access_count(&self, chunk_id: i64, count: i64) -> Result<()> {
        let mut inner = self.write()?;
        let stored = inner
            .chunks
            .iter_mut()
            .find(|sc| sc.chunk.id == chunk_id)
            .ok_or_else(|| anyhow!("no chunk {}", chunk_id))?;
        stored.chunk.access_count = count;
        Ok(())
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn rank_and_truncate(
    mut candidates: Vec<ChunkCandidate>,
    ascending: bool,
    limit: i64,
) -> Vec<ChunkCandidate> {
    candidates.sort_by(|a, b| {
        let by_score = if ascending {
            a.raw_score.total_cmp(&b.raw_score)
        } else {
            b.raw_score.total_cmp(&a.raw_score)
        };
        by_score.then(a.chunk.id.cmp(&b.chunk.id))
    });
    candidates.truncate(limit.max(0) as usize);
    candidates
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_library(&self, name: &str) -> Result<Library> {
        let mut inner = self.write()?;
        if inner.libraries.iter().any(|l| l.name == name) {
            return Err(IndexError::AlreadyExists(format!("library '{}'", name)).into());
        }
        inner.next_library_id += 1;
        let library = Library {
            id: inner.next_library_id,
            name: name.to_string(),
            created_at: now_ts(),
        };
        inner.libraries.push(library.clone());
        Ok(library)
    }

    async fn get_library(&self, id: i64) -> Result<Option<Library>> {
        Ok(self.read()?.libraries.iter().find(|l| l.id == id).cloned())
    }

    async fn list_libraries(&self) -> Result<Vec<Library>> {
        Ok(self.read()?.libraries.clone())
    }

    async fn insert_upload(&self, upload: &NewUpload) -> Result<DocumentUpload> {
        let mut inner = self.write()?;
        let duplicate = inner.uploads.values().any(|u| {
            u.library_id == upload.library_id
                && u.version == upload.version
                && u.content_hash == upload.content_hash
                && u.status != UploadStatus::Deleted
        });
        if duplicate {
            return Err(IndexError::AlreadyExists(format!(
                "document with hash {} in library {} version {}",
                upload.content_hash, upload.library_id, upload.version
            ))
            .into());
        }
        inner.next_upload_id += 1;
        let now = now_ts();
        let record = DocumentUpload {
            id: inner.next_upload_id,
            library_id: upload.library_id,
            version: upload.version.clone(),
            title: upload.title.clone(),
            filename: upload.filename.clone(),
            storage_key: upload.storage_key.clone(),
            file_type: upload.file_type,
            file_size: upload.file_size,
            content_hash: upload.content_hash.clone(),
            chunk_count: 0,
            token_count: 0,
            status: UploadStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        inner.uploads.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_upload(&self, id: i64) -> Result<Option<DocumentUpload>> {
        Ok(self.read()?.uploads.get(&id).cloned())
    }

    async fn find_upload_by_hash(
        &self,
        library_id: i64,
        version: &str,
        content_hash: &str,
    ) -> Result<Option<DocumentUpload>> {
        Ok(self
            .read()?
            .uploads
            .values()
            .find(|u| {
                u.library_id == library_id
                    && u.version == version
                    && u.content_hash == content_hash
                    && u.status != UploadStatus::Deleted
            })
            .cloned())
    }

    async fn list_uploads(&self, library_id: i64, version: &str) -> Result<Vec<DocumentUpload>> {
        Ok(self
            .read()?
            .uploads
            .values()
            .filter(|u| {
                u.library_id == library_id
                    && u.version == version
                    && u.status != UploadStatus::Deleted
            })
            .cloned()
            .collect())
    }

    async fn set_upload_status(
        &self,
        id: i64,
        status: UploadStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(upload) = inner.uploads.get_mut(&id) {
            upload.status = status;
            upload.error_message = error_message.map(str::to_string);
            upload.updated_at = now_ts();
        }
        Ok(())
    }

    async fn complete_upload(&self, id: i64, chunk_count: i64, token_count: i64) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(upload) = inner.uploads.get_mut(&id) {
            upload.status = UploadStatus::Completed;
            upload.error_message = None;
            upload.chunk_count = chunk_count;
            upload.token_count = token_count;
            upload.updated_at = now_ts();
        }
        Ok(())
    }

    async fn delete_upload(&self, id: i64) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.uploads.get_mut(&id) {
            Some(upload) if upload.status != UploadStatus::Deleted => {
                upload.status = UploadStatus::Deleted;
                upload.updated_at = now_ts();
            }
            _ => return Ok(false),
        }
        for sc in inner.chunks.iter_mut() {
            if sc.chunk.document_upload_id == Some(id) {
                sc.chunk.status = ChunkStatus::Deleted;
            }
        }
        Ok(true)
    }

    async fn next_batch_version(&self, library_id: i64, version: &str) -> Result<i64> {
        Ok(self.write()?.allocate_batch(library_id, version, 0))
    }

    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()> {
        let mut inner = self.write()?;
        let now = now_ts();
        for c in chunks {
            inner.next_chunk_id += 1;
            let chunk = Chunk {
                id: inner.next_chunk_id,
                library_id: c.library_id,
                document_upload_id: c.document_upload_id,
                version: c.version.clone(),
                chunk_index: c.chunk_index,
                text: c.text.clone(),
                title: c.title.clone(),
                description: c.description.clone(),
                code: c.code.clone(),
                language: c.language.clone(),
                chunk_type: c.chunk_type,
                token_count: c.token_count,
                access_count: 0,
                status: ChunkStatus::Pending,
                batch_version: c.batch_version,
                created_at: now,
            };
            inner.chunks.push(StoredChunk {
                chunk,
                embedding: c.embedding.clone(),
            });
        }
        Ok(())
    }

    async fn swap_generation(
        &self,
        library_id: i64,
        version: &str,
        batch_version: i64,
        replaced_uploads: &[i64],
    ) -> Result<SwapOutcome> {
        let mut inner = self.write()?;
        let replaced: HashSet<i64> = replaced_uploads.iter().copied().collect();
        let is_replaced = |c: &Chunk| c.document_upload_id.is_some_and(|u| replaced.contains(&u));

        let max_active = inner
            .in_pair(library_id, version)
            .filter(|c| c.status == ChunkStatus::Active)
            .map(|c| c.batch_version)
            .max();
        let target = match max_active {
            Some(active) if active >= batch_version => {
                inner.allocate_batch(library_id, version, active)
            }
            _ => batch_version,
        };

        let mut outcome = SwapOutcome {
            batch_version: target,
            ..SwapOutcome::default()
        };
        for c in inner.in_pair(library_id, version) {
            let status = c.status;
            match status {
                ChunkStatus::Active if is_replaced(c) => {
                    c.status = ChunkStatus::Deleted;
                    outcome.retired += 1;
                }
                ChunkStatus::Active => {
                    if c.batch_version != target {
                        c.batch_version = target;
                        outcome.carried += 1;
                    }
                }
                ChunkStatus::Pending if c.batch_version == batch_version && is_replaced(c) => {
                    c.status = ChunkStatus::Active;
                    c.batch_version = target;
                    outcome.activated += 1;
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    async fn active_chunks(&self, library_id: i64, version: &str) -> Result<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = self
            .read()?
            .chunks
            .iter()
            .map(|sc| &sc.chunk)
            .filter(|c| {
                c.library_id == library_id
                    && c.version == version
                    && c.status == ChunkStatus::Active
            })
            .cloned()
            .collect();
        chunks.sort_by_key(|c| (c.document_upload_id, c.chunk_index, c.id));
        Ok(chunks)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &ChunkFilter,
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>> {
        let inner = self.read()?;
        let candidates = inner
            .chunks
            .iter()
            .filter(|sc| sc.chunk.status == ChunkStatus::Active && filter.accepts(&sc.chunk))
            .map(|sc| ChunkCandidate {
                chunk: sc.chunk.clone(),
                raw_score: cosine_distance(query_vec, &sc.embedding),
            })
            .collect();
        Ok(rank_and_truncate(candidates, true, limit))
    }

    async fn lexical_search(
        &self,
        query: &str,
        filter: &ChunkFilter,
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let candidates = inner
            .chunks
            .iter()
            .filter(|sc| sc.chunk.status == ChunkStatus::Active && filter.accepts(&sc.chunk))
            .filter_map(|sc| {
                let tokens = query_terms(&sc.chunk.text);
                let mut score = 0usize;
                for term in &terms {
                    let tf = tokens.iter().filter(|t| *t == term).count();
                    if tf == 0 {
                        return None;
                    }
                    score += tf;
                }
                Some(ChunkCandidate {
                    chunk: sc.chunk.clone(),
                    raw_score: score as f64,
                })
            })
            .collect();
        Ok(rank_and_truncate(candidates, false, limit))
    }

    async fn increment_access(&self, chunk_ids: &[i64]) -> Result<()> {
        let mut inner = self.write()?;
        for id in chunk_ids {
            if let Some(sc) = inner.chunks.iter_mut().find(|sc| sc.chunk.id == *id) {
                sc.chunk.access_count += 1;
            }
        }
        Ok(())
    }

    async fn collect_garbage(&self) -> Result<u64> {
        let mut inner = self.write()?;
        let Inner {
            chunks, uploads, ..
        } = &mut *inner;
        let before = chunks.len();
        chunks.retain(|sc| match sc.chunk.status {
            ChunkStatus::Active => true,
            ChunkStatus::Deleted => false,
            ChunkStatus::Pending => sc
                .chunk
                .document_upload_id
                .and_then(|id| uploads.get(&id))
                .is_some_and(|u| u.status == UploadStatus::Processing),
        });
        Ok((before - chunks.len()) as u64)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let inner = self.read()?;
        let count = |status: ChunkStatus| {
            inner
                .chunks
                .iter()
                .filter(|sc| sc.chunk.status == status)
                .count() as i64
        };
        Ok(IndexStats {
            libraries: inner.libraries.len() as i64,
            uploads: inner
                .uploads
                .values()
                .filter(|u| u.status != UploadStatus::Deleted)
                .count() as i64,
            active_chunks: count(ChunkStatus::Active),
            pending_chunks: count(ChunkStatus::Pending),
            deleted_chunks: count(ChunkStatus::Deleted),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkType, FileType};

    fn new_upload(library_id: i64, version: &str, hash: &str) -> NewUpload {
        NewUpload {
            library_id,
            version: version.to_string(),
            title: format!("doc-{}", hash),
            filename: format!("{}.md", hash),
            storage_key: format!("docs/lib/{}/{}.md", version, hash),
            file_type: FileType::Markdown,
            file_size: 10,
            content_hash: hash.to_string(),
        }
    }

    fn new_chunk(upload: &DocumentUpload, index: i64, text: &str, batch: i64) -> NewChunk {
        NewChunk {
            library_id: upload.library_id,
            document_upload_id: Some(upload.id),
            version: upload.version.clone(),
            chunk_index: index,
            text: text.to_string(),
            title: None,
            description: None,
            code: None,
            language: "markdown".to_string(),
            chunk_type: ChunkType::Info,
            token_count: 3,
            embedding: vec![1.0, index as f32],
            batch_version: batch,
        }
    }

    fn filter(library_id: i64) -> ChunkFilter {
        ChunkFilter {
            library_id,
            version: None,
            mode: None,
        }
    }

    #[tokio::test]
    async fn test_pending_rows_invisible_until_swap() {
        let store = InMemoryStore::new();
        let lib = store.create_library("tokio").await.unwrap();
        let up = store.insert_upload(&new_upload(lib.id, "1.0", "a")).await.unwrap();
        let batch = store.next_batch_version(lib.id, "1.0").await.unwrap();
        store
            .insert_chunks(&[new_chunk(&up, 0, "runtime builder", batch)])
            .await
            .unwrap();

        assert!(store.active_chunks(lib.id, "1.0").await.unwrap().is_empty());
        let hits = store.lexical_search("runtime", &filter(lib.id), 10).await.unwrap();
        assert!(hits.is_empty());

        let outcome = store
            .swap_generation(lib.id, "1.0", batch, &[up.id])
            .await
            .unwrap();
        assert_eq!(outcome.activated, 1);
        assert_eq!(outcome.batch_version, batch);
        assert_eq!(store.active_chunks(lib.id, "1.0").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_swap_retires_replaced_and_carries_others() {
        let store = InMemoryStore::new();
        let lib = store.create_library("serde").await.unwrap();
        let a = store.insert_upload(&new_upload(lib.id, "1", "a")).await.unwrap();
        let b = store.insert_upload(&new_upload(lib.id, "1", "b")).await.unwrap();

        let b1 = store.next_batch_version(lib.id, "1").await.unwrap();
        store
            .insert_chunks(&[new_chunk(&a, 0, "a0", b1), new_chunk(&b, 0, "b0", b1)])
            .await
            .unwrap();
        store.swap_generation(lib.id, "1", b1, &[a.id, b.id]).await.unwrap();

        let b2 = store.next_batch_version(lib.id, "1").await.unwrap();
        assert!(b2 > b1);
        store
            .insert_chunks(&[new_chunk(&a, 0, "a0 new", b2), new_chunk(&a, 1, "a1 new", b2)])
            .await
            .unwrap();
        let outcome = store.swap_generation(lib.id, "1", b2, &[a.id]).await.unwrap();
        assert_eq!(
            outcome,
            SwapOutcome {
                batch_version: b2,
                activated: 2,
                retired: 1,
                carried: 1
            }
        );

        let active = store.active_chunks(lib.id, "1").await.unwrap();
        let texts: Vec<&str> = active.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a0 new", "a1 new", "b0"]);
        assert!(active.iter().all(|c| c.batch_version == b2));
    }

    #[tokio::test]
    async fn test_stale_swap_gets_fresh_batch_version() {
        let store = InMemoryStore::new();
        let lib = store.create_library("axum").await.unwrap();
        let a = store.insert_upload(&new_upload(lib.id, "1", "a")).await.unwrap();
        let b = store.insert_upload(&new_upload(lib.id, "1", "b")).await.unwrap();

        let early = store.next_batch_version(lib.id, "1").await.unwrap();
        let late = store.next_batch_version(lib.id, "1").await.unwrap();
        store.insert_chunks(&[new_chunk(&b, 0, "b0", late)]).await.unwrap();
        store.swap_generation(lib.id, "1", late, &[b.id]).await.unwrap();

        store.insert_chunks(&[new_chunk(&a, 0, "a0", early)]).await.unwrap();
        let outcome = store.swap_generation(lib.id, "1", early, &[a.id]).await.unwrap();
        assert!(outcome.batch_version > late);

        let active = store.active_chunks(lib.id, "1").await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|c| c.batch_version == outcome.batch_version));
    }

    #[tokio::test]
    async fn test_delete_upload_and_garbage_collection() {
        let store = InMemoryStore::new();
        let lib = store.create_library("rayon").await.unwrap();
        let a = store.insert_upload(&new_upload(lib.id, "1", "a")).await.unwrap();
        let b = store.insert_upload(&new_upload(lib.id, "1", "b")).await.unwrap();
        let batch = store.next_batch_version(lib.id, "1").await.unwrap();
        store
            .insert_chunks(&[new_chunk(&a, 0, "a0", batch), new_chunk(&b, 0, "b0", batch)])
            .await
            .unwrap();
        store.swap_generation(lib.id, "1", batch, &[a.id, b.id]).await.unwrap();

        // orphan from a failed run of b
        let orphan_batch = store.next_batch_version(lib.id, "1").await.unwrap();
        store
            .insert_chunks(&[new_chunk(&b, 0, "b0 retry", orphan_batch)])
            .await
            .unwrap();
        store
            .set_upload_status(b.id, UploadStatus::Failed, Some("provider down"))
            .await
            .unwrap();

        assert!(store.delete_upload(a.id).await.unwrap());
        assert!(!store.delete_upload(a.id).await.unwrap());
        assert!(!store.delete_upload(999).await.unwrap());
        assert!(store
            .find_upload_by_hash(lib.id, "1", "a")
            .await
            .unwrap()
            .is_none());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.active_chunks, 1);
        assert_eq!(stats.pending_chunks, 1);
        assert_eq!(stats.deleted_chunks, 1);

        assert_eq!(store.collect_garbage().await.unwrap(), 2);
        let remaining = store.all_chunks().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].text, "b0");
    }

    #[tokio::test]
    async fn test_gc_keeps_pending_rows_of_processing_uploads() {
        let store = InMemoryStore::new();
        let lib = store.create_library("hyper").await.unwrap();
        let a = store.insert_upload(&new_upload(lib.id, "1", "a")).await.unwrap();
        store
            .set_upload_status(a.id, UploadStatus::Processing, None)
            .await
            .unwrap();
        let batch = store.next_batch_version(lib.id, "1").await.unwrap();
        store.insert_chunks(&[new_chunk(&a, 0, "a0", batch)]).await.unwrap();
        assert_eq!(store.collect_garbage().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lexical_requires_every_term() {
        let store = InMemoryStore::new();
        let lib = store.create_library("reqwest").await.unwrap();
        let a = store.insert_upload(&new_upload(lib.id, "1", "a")).await.unwrap();
        let batch = store.next_batch_version(lib.id, "1").await.unwrap();
        store
            .insert_chunks(&[
                new_chunk(&a, 0, "client timeout settings", batch),
                new_chunk(&a, 1, "client builder client pool", batch),
                new_chunk(&a, 2, "unrelated", batch),
            ])
            .await
            .unwrap();
        store.swap_generation(lib.id, "1", batch, &[a.id]).await.unwrap();

        let hits = store.lexical_search("client", &filter(lib.id), 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.text, "client builder client pool");
        assert_eq!(hits[0].raw_score, 2.0);

        let hits = store
            .lexical_search("client timeout", &filter(lib.id), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.chunk_index, 0);
    }
}
