//! SQLite-backed [`Store`] implementation.
//!
//! Chunk rows of every generation live in one `chunks` table; visibility is
//! decided by the `status` column alone. Lexical retrieval goes through the
//! `chunks_fts` FTS5 table (bm25, every query term required), vector
//! retrieval is a brute-force cosine scan over the `embedding` BLOBs of the
//! filtered active rows. [`Store::swap_generation`] runs as one transaction,
//! so readers see either the old or the new generation and never both.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::query::Query;
use sqlx::{Row, SqlitePool};

use docsift_core::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use docsift_core::error::IndexError;
use docsift_core::models::{
    Chunk, ChunkStatus, ChunkType, DocumentUpload, FileType, Library, NewChunk, NewUpload,
    UploadStatus,
};
use docsift_core::store::{
    query_terms, ChunkCandidate, ChunkFilter, IndexStats, Store, SwapOutcome,
};

const CHUNK_COLUMNS: &str = "c.id, c.library_id, c.document_upload_id, c.version, c.chunk_index, \
     c.text, c.title, c.description, c.code, c.language, c.chunk_type, c.token_count, \
     c.access_count, c.status, c.batch_version, c.created_at";

const UPLOAD_COLUMNS: &str = "id, library_id, version, title, filename, storage_key, file_type, \
     file_size, content_hash, chunk_count, token_count, status, error_message, created_at, updated_at";

// Shared WHERE clause for retrieval. Binds: library_id, version (x2), mode types (x3).
const FILTER_SQL: &str = "c.library_id = ? AND c.status = 'active' \
     AND (? IS NULL OR c.version = ?) \
     AND (? IS NULL OR c.chunk_type IN (?, ?))";

const GARBAGE_SQL: &str = "status = 'deleted' OR (status = 'pending' AND NOT EXISTS ( \
     SELECT 1 FROM document_uploads u \
     WHERE u.id = chunks.document_upload_id AND u.status = 'processing'))";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn library_from_row(row: &SqliteRow) -> Result<Library> {
    Ok(Library {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn upload_from_row(row: &SqliteRow) -> Result<DocumentUpload> {
    let file_type: String = row.try_get("file_type")?;
    let status: String = row.try_get("status")?;
    Ok(DocumentUpload {
        id: row.try_get("id")?,
        library_id: row.try_get("library_id")?,
        version: row.try_get("version")?,
        title: row.try_get("title")?,
        filename: row.try_get("filename")?,
        storage_key: row.try_get("storage_key")?,
        file_type: FileType::parse(&file_type)
            .ok_or_else(|| anyhow!("invalid file type '{}' in document_uploads", file_type))?,
        file_size: row.try_get("file_size")?,
        content_hash: row.try_get("content_hash")?,
        chunk_count: row.try_get("chunk_count")?,
        token_count: row.try_get("token_count")?,
        status: UploadStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid upload status '{}'", status))?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let chunk_type: String = row.try_get("chunk_type")?;
    let status: String = row.try_get("status")?;
    Ok(Chunk {
        id: row.try_get("id")?,
        library_id: row.try_get("library_id")?,
        document_upload_id: row.try_get("document_upload_id")?,
        version: row.try_get("version")?,
        chunk_index: row.try_get("chunk_index")?,
        text: row.try_get("text")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        code: row.try_get("code")?,
        language: row.try_get("language")?,
        chunk_type: ChunkType::parse(&chunk_type)
            .ok_or_else(|| anyhow!("invalid chunk type '{}'", chunk_type))?,
        token_count: row.try_get("token_count")?,
        access_count: row.try_get("access_count")?,
        status: ChunkStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid chunk status '{}'", status))?,
        batch_version: row.try_get("batch_version")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Bind the parameters of [`FILTER_SQL`] in order.
fn bind_filter<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    filter: &'q ChunkFilter,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    let types = filter.mode.map(|m| m.chunk_types());
    query
        .bind(filter.library_id)
        .bind(filter.version.as_deref())
        .bind(filter.version.as_deref())
        .bind(filter.mode.map(|m| m.as_str()))
        .bind(types.map(|t| t[0].as_str()))
        .bind(types.map(|t| t[1].as_str()))
}

/// FTS5 expression requiring every term: `"a" "b"`.
fn fts_match_expr(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn sort_candidates(candidates: &mut [ChunkCandidate], ascending: bool) {
    candidates.sort_by(|a, b| {
        let by_score = if ascending {
            a.raw_score.total_cmp(&b.raw_score)
        } else {
            b.raw_score.total_cmp(&a.raw_score)
        };
        by_score.then(a.chunk.id.cmp(&b.chunk.id))
    });
}

/// Bump the (library, version) counter past `at_least` and return it.
async fn allocate_batch<'e, E>(executor: E, library_id: i64, version: &str, at_least: i64) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let next: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO batch_versions (library_id, version, current)
        VALUES (?, ?, ? + 1)
        ON CONFLICT(library_id, version) DO UPDATE SET
            current = MAX(current, ?) + 1
        RETURNING current
        "#,
    )
    .bind(library_id)
    .bind(version)
    .bind(at_least)
    .bind(at_least)
    .fetch_one(executor)
    .await?;
    Ok(next)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_library(&self, name: &str) -> Result<Library> {
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM libraries WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(IndexError::AlreadyExists(format!("library '{}'", name)).into());
        }

        let now = now_ts();
        let id = sqlx::query("INSERT INTO libraries (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    IndexError::AlreadyExists(format!("library '{}'", name)).into()
                } else {
                    anyhow::Error::from(e)
                }
            })?
            .last_insert_rowid();

        Ok(Library {
            id,
            name: name.to_string(),
            created_at: now,
        })
    }

    async fn get_library(&self, id: i64) -> Result<Option<Library>> {
        let row = sqlx::query("SELECT id, name, created_at FROM libraries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(library_from_row).transpose()
    }

    async fn list_libraries(&self) -> Result<Vec<Library>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM libraries ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(library_from_row).collect()
    }

    async fn insert_upload(&self, upload: &NewUpload) -> Result<DocumentUpload> {
        let now = now_ts();
        let id = sqlx::query(
            r#"
            INSERT INTO document_uploads (library_id, version, title, filename, storage_key,
                                          file_type, file_size, content_hash, status,
                                          created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(upload.library_id)
        .bind(&upload.version)
        .bind(&upload.title)
        .bind(&upload.filename)
        .bind(&upload.storage_key)
        .bind(upload.file_type.as_str())
        .bind(upload.file_size)
        .bind(&upload.content_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                IndexError::AlreadyExists(format!(
                    "document with hash {} in library {} version {}",
                    upload.content_hash, upload.library_id, upload.version
                ))
                .into()
            } else {
                anyhow::Error::from(e)
            }
        })?
        .last_insert_rowid();

        self.get_upload(id)
            .await?
            .ok_or_else(|| anyhow!("upload {} vanished after insert", id))
    }

    async fn get_upload(&self, id: i64) -> Result<Option<DocumentUpload>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM document_uploads WHERE id = ?",
            UPLOAD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(upload_from_row).transpose()
    }

    async fn find_upload_by_hash(
        &self,
        library_id: i64,
        version: &str,
        content_hash: &str,
    ) -> Result<Option<DocumentUpload>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM document_uploads \
             WHERE library_id = ? AND version = ? AND content_hash = ? AND status != 'deleted' \
             ORDER BY id LIMIT 1",
            UPLOAD_COLUMNS
        ))
        .bind(library_id)
        .bind(version)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(upload_from_row).transpose()
    }

    async fn list_uploads(&self, library_id: i64, version: &str) -> Result<Vec<DocumentUpload>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM document_uploads \
             WHERE library_id = ? AND version = ? AND status != 'deleted' ORDER BY id",
            UPLOAD_COLUMNS
        ))
        .bind(library_id)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(upload_from_row).collect()
    }

    async fn set_upload_status(
        &self,
        id: i64,
        status: UploadStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE document_uploads SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_upload(&self, id: i64, chunk_count: i64, token_count: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE document_uploads
            SET status = 'completed', error_message = NULL,
                chunk_count = ?, token_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(chunk_count)
        .bind(token_count)
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_upload(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            "UPDATE document_uploads SET status = 'deleted', updated_at = ? \
             WHERE id = ? AND status != 'deleted'",
        )
        .bind(now_ts())
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if flipped == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE chunks SET status = 'deleted' WHERE document_upload_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn next_batch_version(&self, library_id: i64, version: &str) -> Result<i64> {
        allocate_batch(&self.pool, library_id, version, 0).await
    }

    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<()> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            let blob = vec_to_blob(&chunk.embedding);
            let id = sqlx::query(
                r#"
                INSERT INTO chunks (library_id, document_upload_id, version, chunk_index, text,
                                    title, description, code, language, chunk_type, token_count,
                                    embedding, status, batch_version, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
                "#,
            )
            .bind(chunk.library_id)
            .bind(chunk.document_upload_id)
            .bind(&chunk.version)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.title)
            .bind(&chunk.description)
            .bind(&chunk.code)
            .bind(&chunk.language)
            .bind(chunk.chunk_type.as_str())
            .bind(chunk.token_count)
            .bind(&blob)
            .bind(chunk.batch_version)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            sqlx::query("INSERT INTO chunks_fts (chunk_id, text) VALUES (?, ?)")
                .bind(id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn swap_generation(
        &self,
        library_id: i64,
        version: &str,
        batch_version: i64,
        replaced_uploads: &[i64],
    ) -> Result<SwapOutcome> {
        let mut tx = self.pool.begin().await?;

        // Take the write lock before reading the active batch.
        sqlx::query("UPDATE batch_versions SET current = current WHERE library_id = ? AND version = ?")
            .bind(library_id)
            .bind(version)
            .execute(&mut *tx)
            .await?;

        let max_active: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(batch_version) FROM chunks \
             WHERE library_id = ? AND version = ? AND status = 'active'",
        )
        .bind(library_id)
        .bind(version)
        .fetch_one(&mut *tx)
        .await?;

        let target = match max_active {
            Some(active) if active >= batch_version => {
                allocate_batch(&mut *tx, library_id, version, active).await?
            }
            _ => batch_version,
        };

        let mut outcome = SwapOutcome {
            batch_version: target,
            ..SwapOutcome::default()
        };

        for upload_id in replaced_uploads {
            outcome.retired += sqlx::query(
                "UPDATE chunks SET status = 'deleted' \
                 WHERE library_id = ? AND version = ? AND status = 'active' AND document_upload_id = ?",
            )
            .bind(library_id)
            .bind(version)
            .bind(upload_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        outcome.carried = sqlx::query(
            "UPDATE chunks SET batch_version = ? \
             WHERE library_id = ? AND version = ? AND status = 'active' AND batch_version != ?",
        )
        .bind(target)
        .bind(library_id)
        .bind(version)
        .bind(target)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        for upload_id in replaced_uploads {
            outcome.activated += sqlx::query(
                "UPDATE chunks SET status = 'active', batch_version = ? \
                 WHERE library_id = ? AND version = ? AND status = 'pending' \
                   AND batch_version = ? AND document_upload_id = ?",
            )
            .bind(target)
            .bind(library_id)
            .bind(version)
            .bind(batch_version)
            .bind(upload_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn active_chunks(&self, library_id: i64, version: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks c \
             WHERE c.library_id = ? AND c.version = ? AND c.status = 'active' \
             ORDER BY c.document_upload_id, c.chunk_index, c.id",
            CHUNK_COLUMNS
        ))
        .bind(library_id)
        .bind(version)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &ChunkFilter,
        limit: i64,
    ) -> Result<Vec<ChunkCandidate>> {
        let sql = format!(
            "SELECT {}, c.embedding FROM chunks c WHERE {}",
            CHUNK_COLUMNS, FILTER_SQL
        );
        let rows = bind_filter(sqlx::query(&sql), filter)
            .fetch_all(&self.pool)
            .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            candidates.push(ChunkCandidate {
                chunk: chunk_from_row(row)?,
                raw_score: cosine_distance(query_vec, &blob_to_vec(&blob)),
            });
        }

        sort_candidates(&mut candidates, true);
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
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
        let expr = fts_match_expr(&terms);

        let sql = format!(
            "SELECT {}, bm25(chunks_fts) AS bm25_score \
             FROM chunks_fts JOIN chunks c ON c.id = chunks_fts.chunk_id \
             WHERE chunks_fts MATCH ? AND {} \
             ORDER BY bm25_score, c.id LIMIT ?",
            CHUNK_COLUMNS, FILTER_SQL
        );
        let rows = bind_filter(sqlx::query(&sql).bind(&expr), filter)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let bm25: f64 = row.try_get("bm25_score")?;
            candidates.push(ChunkCandidate {
                chunk: chunk_from_row(row)?,
                // bm25() is negated: lower is better.
                raw_score: (-bm25).max(0.0),
            });
        }
        sort_candidates(&mut candidates, false);
        Ok(candidates)
    }

    async fn increment_access(&self, chunk_ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in chunk_ids {
            sqlx::query("UPDATE chunks SET access_count = access_count + 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn collect_garbage(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE {})",
            GARBAGE_SQL
        ))
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query(&format!("DELETE FROM chunks WHERE {}", GARBAGE_SQL))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let libraries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM libraries")
            .fetch_one(&self.pool)
            .await?;
        let uploads: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_uploads WHERE status != 'deleted'")
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM chunks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = IndexStats {
            libraries,
            uploads,
            ..IndexStats::default()
        };
        for row in &rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match ChunkStatus::parse(&status) {
                Some(ChunkStatus::Active) => stats.active_chunks = n,
                Some(ChunkStatus::Pending) => stats.pending_chunks = n,
                Some(ChunkStatus::Deleted) => stats.deleted_chunks = n,
                None => return Err(anyhow!("invalid chunk status '{}'", status)),
            }
        }
        Ok(stats)
    }
}
