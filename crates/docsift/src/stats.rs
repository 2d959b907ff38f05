//! Database statistics and health overview.
//!
//! Summarizes what is indexed: libraries, uploads by status, chunks by
//! status, and a per-(library, version) breakdown of the live generation.
//! Used by `sift stats`.

use anyhow::Result;
use sqlx::Row;

use docsift_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::progress::format_number;
use crate::sqlite_store::SqliteStore;

struct VersionStats {
    library: String,
    version: String,
    uploads: i64,
    active_chunks: i64,
    batch_version: Option<i64>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let stats = store.stats().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docsift database stats");
    println!("=====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Libraries:   {}", format_number(stats.libraries));
    println!("  Uploads:     {}", format_number(stats.uploads));
    println!(
        "  Chunks:      {} active, {} pending, {} deleted",
        format_number(stats.active_chunks),
        format_number(stats.pending_chunks),
        format_number(stats.deleted_chunks)
    );

    let status_rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM document_uploads GROUP BY status ORDER BY status",
    )
    .fetch_all(&pool)
    .await?;
    if !status_rows.is_empty() {
        let parts: Vec<String> = status_rows
            .iter()
            .map(|r| format!("{} {}", r.get::<i64, _>("n"), r.get::<String, _>("status")))
            .collect();
        println!("  By status:   {}", parts.join(", "));
    }

    let rows = sqlx::query(
        r#"
        SELECT
            l.name AS library,
            u.version AS version,
            COUNT(DISTINCT u.id) AS uploads,
            COUNT(DISTINCT c.id) AS active_chunks,
            MAX(c.batch_version) AS batch_version
        FROM libraries l
        JOIN document_uploads u ON u.library_id = l.id AND u.status != 'deleted'
        LEFT JOIN chunks c ON c.document_upload_id = u.id AND c.status = 'active'
        GROUP BY l.name, u.version
        ORDER BY l.name, u.version
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let versions: Vec<VersionStats> = rows
        .iter()
        .map(|row| VersionStats {
            library: row.get("library"),
            version: row.get("version"),
            uploads: row.get("uploads"),
            active_chunks: row.get("active_chunks"),
            batch_version: row.get("batch_version"),
        })
        .collect();

    if !versions.is_empty() {
        println!();
        println!("  By version:");
        println!(
            "  {:<24} {:<12} {:>7} {:>8} {:>6}",
            "LIBRARY", "VERSION", "UPLOADS", "CHUNKS", "BATCH"
        );
        println!("  {}", "-".repeat(61));
        for v in &versions {
            println!(
                "  {:<24} {:<12} {:>7} {:>8} {:>6}",
                v.library,
                v.version,
                v.uploads,
                v.active_chunks,
                v.batch_version
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
