//! # docsift
//!
//! **Versioned documentation indexer with hybrid search.**
//!
//! docsift ingests documentation files into libraries and versions, splits
//! them into token-bounded chunks, embeds every chunk, and serves a fused
//! ranking of semantic similarity, keyword relevance, and popularity.
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Upload  │──▶│  Executor  │──▶│   Indexer    │──▶│  SQLite  │
//! │ service  │   │ (bounded)  │   │ chunk+embed  │   │ FTS5+BLOB│
//! └──────────┘   └────────────┘   └──────────────┘   └────┬─────┘
//!                                                         │
//!                                      ┌──────────────────┘
//!                                      ▼
//!                                ┌──────────┐
//!                                │  Search  │──▶ access counters
//!                                └──────────┘
//! ```
//!
//! Algorithms (chunking, the pipeline, fusion) live in `docsift-core`.
//! This crate supplies the concrete backends and the `sift` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`db`] | SQLite pool (WAL) |
//! | [`migrate`] | Idempotent schema creation |
//! | [`sqlite_store`] | `Store` implementation over sqlx + FTS5 |
//! | [`storage`] | Local-disk blob storage |
//! | [`embedding`] | OpenAI, Ollama, and local providers |
//! | [`cache`] | moka-backed embedding cache |
//! | [`executor`] | Background ingestion with a concurrency bound |
//! | [`uploads`] | Upload intake and deletion |
//! | [`search`] | Search service and result printing |
//! | [`writer`] | Batch-and-flush writer for access counters |
//! | [`progress`] | Progress reporters for the CLI |
//! | [`stats`] | `sift stats` |
//! | [`app`] | Wiring of all of the above |

pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod executor;
pub mod migrate;
pub mod progress;
pub mod search;
pub mod sqlite_store;
pub mod stats;
pub mod storage;
pub mod uploads;
pub mod writer;
