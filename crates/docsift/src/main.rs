//! # docsift CLI (`sift`)
//!
//! ## Usage
//!
//! ```bash
//! sift --config ./config/sift.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sift init` | Create the SQLite database and run schema migrations |
//! | `sift library create <name>` | Register a library |
//! | `sift library list` | List libraries |
//! | `sift upload <file> --library <lib> --version <v>` | Store and index a document |
//! | `sift uploads <lib> <version>` | List uploads of a library version |
//! | `sift delete <upload-id>` | Remove an upload and its chunks |
//! | `sift refresh --library <lib> --version <v>` | Re-index a version with atomic cutover |
//! | `sift search "<query>" --library <lib>` | Hybrid search |
//! | `sift preview <file>` | Show how a file would be chunked |
//! | `sift gc` | Purge deleted and orphaned chunk rows |
//! | `sift stats` | Database summary |
//!
//! ## Examples
//!
//! ```bash
//! sift init
//! sift library create tokio
//! sift upload ./docs/runtime.md --library tokio --version 1.40 --wait
//! sift search "spawn blocking task" --library tokio --mode code
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use docsift::app::App;
use docsift::config;
use docsift::migrate;
use docsift::progress::{format_number, ProgressMode};
use docsift::search::print_page;
use docsift::stats;
use docsift_core::parse::detect_file_type;
use docsift_core::pipeline::{prepare_chunks, IndexerOptions};
use docsift_core::progress::ProgressSink;
use docsift_core::search::SearchRequest;
use docsift_core::store::{SearchMode, Store};

/// docsift: versioned documentation indexer with hybrid search.
///
/// All commands except `preview` read a TOML configuration file given by
/// `--config`.
#[derive(Parser)]
#[command(
    name = "sift",
    about = "docsift: versioned documentation indexer with hybrid search",
    version,
    long_about = "docsift stores documentation files per library and version, splits them into \
    token-bounded chunks, embeds them, and ranks search results by a weighted fusion of semantic \
    similarity, keyword relevance, and popularity."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sift.toml")]
    config: PathBuf,

    /// Log at info level instead of warn (RUST_LOG overrides both).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and the upload directory.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Manage libraries.
    Library {
        #[command(subcommand)]
        action: LibraryAction,
    },

    /// Store a document and index it.
    ///
    /// The file type is taken from the extension (md, markdown, pdf, docx,
    /// json, yaml, yml). Identical content already uploaded to the same
    /// library version is rejected.
    Upload {
        file: PathBuf,

        /// Library name or id.
        #[arg(long)]
        library: String,

        #[arg(long)]
        version: String,

        /// Stream progress until indexing finishes.
        #[arg(long)]
        wait: bool,

        /// Progress output: off, human, or json. Defaults to human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// List the uploads of a library version.
    Uploads {
        /// Library name or id.
        library: String,
        version: String,
    },

    /// Delete an upload and its chunks.
    Delete { upload_id: i64 },

    /// Re-index every document of a library version and switch atomically.
    ///
    /// Ctrl-C cancels between documents and leaves the live index untouched.
    Refresh {
        #[arg(long)]
        library: String,

        #[arg(long)]
        version: String,

        #[arg(long)]
        progress: Option<String>,
    },

    /// Hybrid search over a library.
    Search {
        query: String,

        #[arg(long)]
        library: String,

        /// Restrict to one version.
        #[arg(long)]
        version: Option<String>,

        /// `code` or `info`. Mixed chunks match both.
        #[arg(long)]
        mode: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: i64,

        /// Page size; 0 uses the configured default.
        #[arg(long, default_value_t = 0)]
        limit: i64,

        /// Print the result page as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show how a file would be chunked. Needs no config or database.
    Preview {
        file: PathBuf,

        #[arg(long, default_value_t = 512)]
        max_tokens: usize,

        #[arg(long, default_value_t = 0)]
        overlap_tokens: usize,
    },

    /// Physically remove deleted chunks and orphaned pending rows.
    Gc,

    /// Show database statistics.
    Stats,
}

#[derive(Subcommand)]
enum LibraryAction {
    Create { name: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "info" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Commands that don't require config
    if let Commands::Preview {
        file,
        max_tokens,
        overlap_tokens,
    } = &cli.command
    {
        return run_preview(file, *max_tokens, *overlap_tokens);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.storage.root).with_context(|| {
                format!("Failed to create {}", cfg.storage.root.display())
            })?;
            println!("Database initialized successfully.");
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        command => {
            let app = App::open(&cfg).await?;
            let result = run_command(&app, command).await;
            app.close().await?;
            result?;
        }
    }

    Ok(())
}

async fn run_command(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Library { action } => match action {
            LibraryAction::Create { name } => {
                let library = app.store.create_library(&name).await?;
                println!("Created library {} (id {})", library.name, library.id);
            }
            LibraryAction::List => {
                let libraries = app.store.list_libraries().await?;
                if libraries.is_empty() {
                    println!("No libraries.");
                }
                for l in libraries {
                    println!("{:>5}  {}", l.id, l.name);
                }
            }
        },
        Commands::Upload {
            file,
            library,
            version,
            wait,
            progress,
        } => {
            let library = app.resolve_library(&library).await?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("Invalid file name: {}", file.display()))?
                .to_string();
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let accepted = app
                .uploads
                .upload(library.id, &version, &filename, &bytes)
                .await?;
            println!(
                "Upload {} accepted ({} bytes)",
                accepted.upload.id,
                format_number(accepted.upload.file_size)
            );

            if wait {
                if let Some(mut rx) = accepted.progress {
                    let reporter = progress_mode(progress.as_deref())?.reporter();
                    while let Some(event) = rx.recv().await {
                        reporter.report(event);
                    }
                }
            }
            app.executor.wait_idle().await;

            if let Some(upload) = app.store.get_upload(accepted.upload.id).await? {
                match upload.error_message {
                    Some(err) => println!("Upload {} {}: {}", upload.id, upload.status.as_str(), err),
                    None => println!(
                        "Upload {} {} ({} chunks, {} tokens)",
                        upload.id,
                        upload.status.as_str(),
                        format_number(upload.chunk_count),
                        format_number(upload.token_count)
                    ),
                }
            }
        }
        Commands::Uploads { library, version } => {
            let library = app.resolve_library(&library).await?;
            let uploads = app.store.list_uploads(library.id, &version).await?;
            if uploads.is_empty() {
                println!("No uploads.");
                return Ok(());
            }
            println!(
                "{:>5}  {:<10} {:>7} {:>8}  {}",
                "ID", "STATUS", "CHUNKS", "TOKENS", "FILE"
            );
            for u in uploads {
                println!(
                    "{:>5}  {:<10} {:>7} {:>8}  {}",
                    u.id,
                    u.status.as_str(),
                    u.chunk_count,
                    u.token_count,
                    u.filename
                );
            }
        }
        Commands::Delete { upload_id } => {
            let upload = app.uploads.delete(upload_id).await?;
            println!("Deleted upload {} ({})", upload.id, upload.filename);
        }
        Commands::Refresh {
            library,
            version,
            progress,
        } => {
            let library = app.resolve_library(&library).await?;
            let reporter = progress_mode(progress.as_deref())?.reporter();

            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("cancelling after the current document...");
                    flag.store(true, Ordering::Relaxed);
                }
            });

            let outcome = app
                .indexer
                .refresh_version(library.id, &version, reporter.as_ref(), Some(cancel.as_ref()))
                .await?;
            println!(
                "Refreshed {} {}: batch {}, {} succeeded, {} failed, {} rows collected",
                library.name,
                version,
                outcome.batch_version,
                outcome.succeeded.len(),
                outcome.failed.len(),
                outcome.collected
            );
            for (id, err) in &outcome.failed {
                println!("  upload {} failed: {}", id, err);
            }
        }
        Commands::Search {
            query,
            library,
            version,
            mode,
            page,
            limit,
            json,
        } => {
            let library = app.resolve_library(&library).await?;
            let mode = match mode.as_deref() {
                None => None,
                Some(m) => match SearchMode::parse(m) {
                    Some(mode) => Some(mode),
                    None => bail!("Unknown search mode: '{}'. Must be code or info.", m),
                },
            };
            let req = SearchRequest {
                library_id: library.id,
                query: &query,
                version: version.as_deref(),
                mode,
                page,
                limit,
            };
            let results = app.search.search(&req, &app.access).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_page(&results);
            }
        }
        Commands::Gc => {
            let removed = app.store.collect_garbage().await?;
            println!("Removed {} chunk rows.", removed);
        }
        Commands::Init | Commands::Stats | Commands::Preview { .. } => {}
    }
    Ok(())
}

fn progress_mode(flag: Option<&str>) -> Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some(s) => match ProgressMode::parse(s) {
            Some(mode) => Ok(mode),
            None => bail!("Unknown progress mode: '{}'. Must be off, human, or json.", s),
        },
    }
}

fn run_preview(file: &Path, max_tokens: usize, overlap_tokens: usize) -> Result<()> {
    if max_tokens == 0 || overlap_tokens >= max_tokens {
        bail!("--overlap-tokens must be smaller than --max-tokens, which must be > 0");
    }
    let filename = file.to_string_lossy();
    let file_type = detect_file_type(&filename)?;
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let options = IndexerOptions {
        max_tokens,
        overlap_tokens,
        ..IndexerOptions::default()
    };
    let drafts = prepare_chunks(&bytes, file_type, &options)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    println!(
        "{}: {} chunks ({})",
        file.display(),
        drafts.len(),
        file_type.as_str()
    );
    for d in &drafts {
        println!(
            "--- chunk {} · {} · {} tokens{}",
            d.index,
            d.chunk_type.as_str(),
            d.token_count,
            d.title
                .as_deref()
                .map(|t| format!(" · {}", t))
                .unwrap_or_default()
        );
        println!("{}", d.text);
    }
    Ok(())
}
