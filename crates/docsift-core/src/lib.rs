//! # docsift core
//!
//! Runtime-agnostic logic for docsift: data models, markdown preparation,
//! chunking, embedding coordination, the store and blob-storage
//! abstractions, the indexing pipeline, and the hybrid retrieval engine.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Concrete
//! backends (SQLite store, HTTP embedding providers, local-disk storage)
//! live in the `docsift` app crate and plug in through the traits
//! defined here.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Chunk, upload, and library records plus their enums |
//! | [`error`] | Typed error taxonomy carried inside `anyhow::Error` |
//! | [`parse`] | File-type detection and markdown clean-up |
//! | [`chunk`] | Token-bounded paragraph chunker with overlap and classification |
//! | [`embedding`] | Provider trait, batch contract checks, vector utilities |
//! | [`cache`] | Content-hash embedding cache and the caching decorator |
//! | [`store`] | `Store` trait and the in-memory implementation |
//! | [`storage`] | Raw-file blob storage contract |
//! | [`progress`] | Ingestion progress events and sinks |
//! | [`pipeline`] | Per-document ingestion and version refresh with atomic cutover |
//! | [`search`] | Vector + lexical + popularity fusion and pagination |

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod progress;
pub mod search;
pub mod storage;
pub mod store;
