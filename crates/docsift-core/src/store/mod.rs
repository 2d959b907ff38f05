//! Storage abstraction for docsift.
//!
//! The [`Store`] trait defines every persistence operation the indexing
//! pipeline and the retrieval engine need, enabling pluggable backends
//! (SQLite in the app crate, [`memory::InMemoryStore`] for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Generations
//!
//! Chunks are written as `pending` rows stamped with a batch version from
//! [`Store::next_batch_version`] and become visible only through
//! [`Store::swap_generation`], which backends must apply as one atomic
//! unit. After every successful swap all `active` rows of a
//! (library, version) pair carry the same batch version.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{
    Chunk, ChunkType, DocumentUpload, Library, NewChunk, NewUpload, UploadStatus,
};

/// Restricts retrieval to chunk types compatible with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Code and mixed chunks.
    Code,
    /// Info and mixed chunks.
    Info,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(SearchMode::Code),
            "info" => Some(SearchMode::Info),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Code => "code",
            SearchMode::Info => "info",
        }
    }

    pub fn matches(&self, chunk_type: ChunkType) -> bool {
        matches!(
            (self, chunk_type),
            (_, ChunkType::Mixed) | (SearchMode::Code, ChunkType::Code) | (SearchMode::Info, ChunkType::Info)
        )
    }

    /// Chunk types accepted by this mode, for backends that filter in SQL.
    pub fn chunk_types(&self) -> [ChunkType; 2] {
        match self {
            SearchMode::Code => [ChunkType::Code, ChunkType::Mixed],
            SearchMode::Info => [ChunkType::Info, ChunkType::Mixed],
        }
    }
}

/// Scope of a retrieval query. Only `active` chunks are ever returned.
#[derive(Debug, Clone)]
pub struct ChunkFilter {
    pub library_id: i64,
    pub version: Option<String>,
    pub mode: Option<SearchMode>,
}

impl ChunkFilter {
    pub fn accepts(&self, chunk: &Chunk) -> bool {
        chunk.library_id == self.library_id
            && self.version.as_ref().map_or(true, |v| *v == chunk.version)
            && self.mode.map_or(true, |m| m.matches(chunk.chunk_type))
    }
}

/// A chunk returned from vector or lexical retrieval.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk: Chunk,
    /// Vector retrieval: cosine distance (lower is closer).
    /// Lexical retrieval: relevance (higher is better, non-negative).
    pub raw_score: f64,
}

/// Row counts touched by a [`Store::swap_generation`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwapOutcome {
    /// The batch version every active row of the pair now carries.
    pub batch_version: i64,
    /// Pending rows flipped to active.
    pub activated: u64,
    /// Previously active rows flipped to deleted.
    pub retired: u64,
    /// Active rows of untouched uploads restamped to the new batch version.
    pub carried: u64,
}

/// Index-wide counters for inspection commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub libraries: i64,
    pub uploads: i64,
    pub active_chunks: i64,
    pub pending_chunks: i64,
    pub deleted_chunks: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_library`](Store::create_library) | Register a library |
/// | [`insert_upload`](Store::insert_upload) | Record a new upload in `pending` |
/// | [`find_upload_by_hash`](Store::find_upload_by_hash) | Dedup lookup within a library version |
/// | [`next_batch_version`](Store::next_batch_version) | Allocate a generation marker |
/// | [`insert_chunks`](Store::insert_chunks) | Write `pending` rows of a generation |
/// | [`swap_generation`](Store::swap_generation) | Atomic pending → active cutover |
/// | [`vector_search`](Store::vector_search) | Nearest chunks by cosine distance |
/// | [`lexical_search`](Store::lexical_search) | Term-frequency ranked chunks |
/// | [`increment_access`](Store::increment_access) | Popularity counter bump |
/// | [`collect_garbage`](Store::collect_garbage) | Purge deleted and orphaned rows |
#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `AlreadyExists` when the name is taken.
    async fn create_library(&self, name: &str) -> Result<Library>;

    async fn get_library(&self, id: i64) -> Result<Option<Library>>;

    async fn list_libraries(&self) -> Result<Vec<Library>>;

    /// Insert an upload record with status `pending`.
    async fn insert_upload(&self, upload: &NewUpload) -> Result<DocumentUpload>;

    async fn get_upload(&self, id: i64) -> Result<Option<DocumentUpload>>;

    /// Find a non-deleted upload with this content hash in (library, version).
    async fn find_upload_by_hash(
        &self,
        library_id: i64,
        version: &str,
        content_hash: &str,
    ) -> Result<Option<DocumentUpload>>;

    /// Non-deleted uploads of (library, version), ordered by id.
    async fn list_uploads(&self, library_id: i64, version: &str) -> Result<Vec<DocumentUpload>>;

    /// Set an upload's status and error message (cleared when `None`).
    async fn set_upload_status(
        &self,
        id: i64,
        status: UploadStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Mark an upload `completed` with its resulting counts.
    async fn complete_upload(&self, id: i64, chunk_count: i64, token_count: i64) -> Result<()>;

    /// Soft-delete an upload and flip all its chunks to `deleted`.
    ///
    /// Returns `false` when the upload does not exist or is already deleted.
    async fn delete_upload(&self, id: i64) -> Result<bool>;

    /// Allocate a batch version for (library, version), strictly greater
    /// than any previously allocated for the pair.
    async fn next_batch_version(&self, library_id: i64, version: &str) -> Result<i64>;

    /// Insert chunks as `pending` rows.
    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()>;

    /// Make generation `batch_version` visible, atomically.
    ///
    /// For the pair (library, version):
    /// 1. Flip active rows of `replaced_uploads` to `deleted`.
    /// 2. Flip pending rows of `batch_version` belonging to `replaced_uploads`
    ///    to `active`.
    /// 3. Restamp every active row of the pair to the resulting batch
    ///    version: `batch_version` itself, or a freshly allocated one when
    ///    a concurrent swap already moved the pair to an equal or greater
    ///    version. The active batch of a pair therefore only ever increases.
    ///
    /// Readers observe either the state before or after, never a mix.
    async fn swap_generation(
        &self,
        library_id: i64,
        version: &str,
        batch_version: i64,
        replaced_uploads: &[i64],
    ) -> Result<SwapOutcome>;

    /// Active chunks of (library, version), ordered by upload then index.
    async fn active_chunks(&self, library_id: i64, version: &str) -> Result<Vec<Chunk>>;

    /// Top `limit` active chunks by ascending cosine distance to `query_vec`.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &ChunkFilter,
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Top `limit` active chunks containing every query term, by descending relevance.
    async fn lexical_search(
        &self,
        query: &str,
        filter: &ChunkFilter,
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>>;

    /// Add one to the access counter of each chunk id.
    async fn increment_access(&self, chunk_ids: &[i64]) -> Result<()>;

    /// Physically remove `deleted` rows and `pending` rows no running
    /// ingestion owns. Returns the number of rows removed.
    async fn collect_garbage(&self) -> Result<u64>;

    async fn stats(&self) -> Result<IndexStats>;
}

/// Lowercased alphanumeric terms of a lexical query.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_matches_mixed_for_both() {
        assert!(SearchMode::Code.matches(ChunkType::Code));
        assert!(SearchMode::Code.matches(ChunkType::Mixed));
        assert!(!SearchMode::Code.matches(ChunkType::Info));
        assert!(SearchMode::Info.matches(ChunkType::Info));
        assert!(SearchMode::Info.matches(ChunkType::Mixed));
        assert!(!SearchMode::Info.matches(ChunkType::Code));
    }

    #[test]
    fn test_query_terms() {
        assert_eq!(query_terms("Auth-flow, OAuth2!"), vec!["auth", "flow", "oauth2"]);
        assert!(query_terms("  ?? ").is_empty());
    }
}
