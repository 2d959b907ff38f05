//! Schema creation.
//!
//! Every statement is `CREATE ... IF NOT EXISTS` (or guarded by a
//! `sqlite_master` lookup for the FTS5 table), so `sift init` can run any
//! number of times.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `libraries` | Named documentation sets |
//! | `document_uploads` | One row per uploaded file and its processing status |
//! | `chunks` | Chunk rows of every generation, with embedding BLOBs |
//! | `chunks_fts` | FTS5 index over chunk text, keyed by chunk id |
//! | `batch_versions` | Monotonic generation counter per (library, version) |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS libraries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_uploads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            library_id INTEGER NOT NULL,
            version TEXT NOT NULL,
            title TEXT NOT NULL,
            filename TEXT NOT NULL,
            storage_key TEXT NOT NULL,
            file_type TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            token_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (library_id) REFERENCES libraries(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // No FK to document_uploads: chunks may outlive their upload record.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            library_id INTEGER NOT NULL,
            document_upload_id INTEGER,
            version TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            title TEXT,
            description TEXT,
            code TEXT,
            language TEXT NOT NULL,
            chunk_type TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            batch_version INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS batch_versions (
            library_id INTEGER NOT NULL,
            version TEXT NOT NULL,
            current INTEGER NOT NULL,
            PRIMARY KEY (library_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_pair_status ON chunks(library_id, version, status)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_upload ON chunks(document_upload_id)")
        .execute(pool)
        .await?;
    // One live upload per content hash in a (library, version) pair.
    sqlx::query("DROP INDEX IF EXISTS idx_uploads_pair_hash")
        .execute(pool)
        .await?;
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_uploads_live_hash
        ON document_uploads(library_id, version, content_hash)
        WHERE status != 'deleted'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
