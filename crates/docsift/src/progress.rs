//! Ingestion progress reporting for the CLI.
//!
//! Renders [`IngestEvent`]s from uploads and refreshes so users see which
//! document is being processed and how far along it is. Progress goes to
//! **stderr** so stdout stays parseable for scripts.

use std::io::Write;

use docsift_core::progress::{IngestEvent, NoProgress, ProgressSink};

/// Human-friendly progress on stderr: "upload 12  embedding  60%  3 chunks".
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, event: IngestEvent) {
        let line = format!("{}\n", render(&event));
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn report(&self, event: IngestEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

fn render(event: &IngestEvent) -> String {
    match event {
        IngestEvent::Stage {
            upload_id,
            stage,
            progress,
            message,
        } => format!(
            "upload {}  {:<13} {:>3}%  {}",
            upload_id,
            stage.as_str(),
            progress,
            message
        ),
        IngestEvent::Completed {
            upload_id,
            chunk_count,
            token_count,
        } => format!(
            "upload {}  completed  {} chunks, {} tokens",
            upload_id,
            format_number(*chunk_count),
            format_number(*token_count)
        ),
        IngestEvent::Failed { upload_id, error } => {
            format!("upload {}  failed: {}", upload_id, error)
        }
        IngestEvent::RefreshStarted {
            library_id,
            version,
            total,
        } => format!(
            "refresh library {} version {}  {} documents",
            library_id, version, total
        ),
        IngestEvent::DocumentStarted {
            current,
            total,
            title,
            ..
        } => format!("refresh  [{}/{}]  {}", current, total, title),
        IngestEvent::DocumentCompleted {
            current,
            total,
            chunk_count,
            ..
        } => format!(
            "refresh  [{}/{}]  done  {} chunks",
            current,
            total,
            format_number(*chunk_count)
        ),
        IngestEvent::DocumentFailed {
            current,
            total,
            error,
            ..
        } => format!("refresh  [{}/{}]  failed: {}", current, total, error),
        IngestEvent::Switching { batch_version } => {
            format!("refresh  switching to batch {}", batch_version)
        }
        IngestEvent::RefreshCompleted {
            batch_version,
            succeeded,
            failed,
        } => format!(
            "refresh  completed  batch {}  ({} ok, {} failed)",
            batch_version, succeeded, failed
        ),
        IngestEvent::RefreshFailed { error } => format!("refresh  failed: {}", error),
    }
}

pub fn format_number(n: i64) -> String {
    let s = n.unsigned_abs().to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3 + 1);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    if n < 0 {
        result.push('-');
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
