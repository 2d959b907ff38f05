//! Ingestion progress events.
//!
//! The pipeline reports each stage of a document and each step of a
//! version refresh to a [`ProgressSink`]. Events are purely observational:
//! a sink that drops them never affects indexing. The app crate forwards
//! them over a bounded channel that closes when the task finishes.

use serde::Serialize;

/// Processing stage of a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Parsing,
    Preprocessing,
    Chunking,
    Embedding,
    Saving,
}

impl Stage {
    /// Nominal completion percentage when the stage begins.
    pub fn percent(&self) -> u8 {
        match self {
            Stage::Parsing => 5,
            Stage::Preprocessing => 10,
            Stage::Chunking => 20,
            Stage::Embedding => 60,
            Stage::Saving => 85,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parsing => "parsing",
            Stage::Preprocessing => "preprocessing",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Saving => "saving",
        }
    }
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IngestEvent {
    Stage {
        upload_id: i64,
        stage: Stage,
        progress: u8,
        message: String,
    },
    Completed {
        upload_id: i64,
        chunk_count: i64,
        token_count: i64,
    },
    Failed {
        upload_id: i64,
        error: String,
    },
    RefreshStarted {
        library_id: i64,
        version: String,
        total: usize,
    },
    DocumentStarted {
        upload_id: i64,
        current: usize,
        total: usize,
        title: String,
    },
    DocumentCompleted {
        upload_id: i64,
        current: usize,
        total: usize,
        chunk_count: i64,
    },
    DocumentFailed {
        upload_id: i64,
        current: usize,
        total: usize,
        error: String,
    },
    Switching {
        batch_version: i64,
    },
    RefreshCompleted {
        batch_version: i64,
        succeeded: usize,
        failed: usize,
    },
    RefreshFailed {
        error: String,
    },
}

impl IngestEvent {
    /// Whether this event ends its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestEvent::Completed { .. }
                | IngestEvent::Failed { .. }
                | IngestEvent::RefreshCompleted { .. }
                | IngestEvent::RefreshFailed { .. }
        )
    }

    pub(crate) fn stage(upload_id: i64, stage: Stage, message: impl Into<String>) -> Self {
        IngestEvent::Stage {
            upload_id,
            stage,
            progress: stage.percent(),
            message: message.into(),
        }
    }
}

/// Receives progress events. Called from the pipeline; must not block.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: IngestEvent);
}

/// Discards every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: IngestEvent) {}
}
