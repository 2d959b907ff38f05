//! Core data models.
//!
//! These types flow between the chunker, the indexing pipeline, the
//! [`Store`](crate::store::Store) backends, and the retrieval engine.
//! Enum values are persisted as their lowercase names (see `as_str`/`parse`).

use serde::{Deserialize, Serialize};

/// Content classification of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Code,
    Info,
    Mixed,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Code => "code",
            ChunkType::Info => "info",
            ChunkType::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(ChunkType::Code),
            "info" => Some(ChunkType::Info),
            "mixed" => Some(ChunkType::Mixed),
            _ => None,
        }
    }
}

/// Visibility state of a chunk row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// Written by an in-progress generation, invisible to search.
    Pending,
    /// Part of the current generation.
    Active,
    /// Superseded or logically deleted.
    Deleted,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Active => "active",
            ChunkStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkStatus::Pending),
            "active" => Some(ChunkStatus::Active),
            "deleted" => Some(ChunkStatus::Deleted),
            _ => None,
        }
    }
}

/// Processing state of a document upload.
///
/// `pending -> processing -> {completed, failed}`; `deleted` is reachable
/// from any state through an explicit delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Deleted,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "processing" => Some(UploadStatus::Processing),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            "deleted" => Some(UploadStatus::Deleted),
            _ => None,
        }
    }
}

/// Accepted source formats. Detected from the file extension by
/// [`parse::detect_file_type`](crate::parse::detect_file_type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Markdown,
    Pdf,
    Docx,
    /// OpenAPI / Swagger definitions in JSON or YAML.
    Swagger,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Markdown => "markdown",
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Swagger => "swagger",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "markdown" => Some(FileType::Markdown),
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "swagger" => Some(FileType::Swagger),
            _ => None,
        }
    }

    /// MIME type handed to blob storage.
    pub fn content_type(&self) -> &'static str {
        match self {
            FileType::Markdown => "text/markdown",
            FileType::Pdf => "application/pdf",
            FileType::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            FileType::Swagger => "application/json",
        }
    }

    /// Language tag recorded on chunks that carry no fenced block.
    pub fn default_language(&self) -> &'static str {
        match self {
            FileType::Markdown => "markdown",
            FileType::Swagger => "openapi",
            FileType::Pdf | FileType::Docx => "text",
        }
    }
}

/// A documentation library. Versions are free-form strings scoped to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Library {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
}

/// Provenance record for one uploaded source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentUpload {
    pub id: i64,
    pub library_id: i64,
    pub version: String,
    pub title: String,
    pub filename: String,
    pub storage_key: String,
    pub file_type: FileType,
    pub file_size: i64,
    /// Hex SHA-256 of the raw bytes; dedup key within (library, version).
    pub content_hash: String,
    pub chunk_count: i64,
    pub token_count: i64,
    pub status: UploadStatus,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields required to create a [`DocumentUpload`]. New uploads start `pending`.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub library_id: i64,
    pub version: String,
    pub title: String,
    pub filename: String,
    pub storage_key: String,
    pub file_type: FileType,
    pub file_size: i64,
    pub content_hash: String,
}

/// Output of the chunker, before embedding and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    /// Ordinal within the document, contiguous from 0.
    pub index: usize,
    pub text: String,
    pub token_count: usize,
    pub chunk_type: ChunkType,
    /// Heading path in effect at the end of the chunk, e.g. `"Guide > Install"`.
    pub title: Option<String>,
    /// Body of the first fenced code block.
    pub code: Option<String>,
    /// Fence info string of that block, when present.
    pub language: Option<String>,
    /// Byte length of the overlap prefix carried over from the previous
    /// chunk, including its trailing paragraph separator. `0` for the first
    /// chunk or when overlap is disabled.
    pub overlap_len: usize,
}

impl ChunkDraft {
    /// The part of the chunk that is new relative to its predecessor.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap_len..]
    }
}

/// A chunk ready to be written as a `pending` row of a new generation.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub library_id: i64,
    pub document_upload_id: Option<i64>,
    pub version: String,
    pub chunk_index: i64,
    pub text: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub code: Option<String>,
    pub language: String,
    pub chunk_type: ChunkType,
    pub token_count: i64,
    pub embedding: Vec<f32>,
    pub batch_version: i64,
}

/// A persisted chunk row, as read back by search and inspection paths.
///
/// The embedding vector is deliberately absent; only the store needs it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: i64,
    pub library_id: i64,
    pub document_upload_id: Option<i64>,
    pub version: String,
    pub chunk_index: i64,
    pub text: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub code: Option<String>,
    pub language: String,
    pub chunk_type: ChunkType,
    pub token_count: i64,
    pub access_count: i64,
    pub status: ChunkStatus,
    pub batch_version: i64,
    pub created_at: i64,
}
