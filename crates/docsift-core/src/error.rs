//! Error taxonomy shared by the pipeline, the retrieval engine, and the
//! app crate.
//!
//! Operations return `anyhow::Result`; these typed errors travel inside the
//! `anyhow::Error` and callers classify them with
//! `err.downcast_ref::<IndexError>()` or [`classify`].

use thiserror::Error;

/// Contract violations of the embedding layer. Always caller-correctable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbedError {
    /// Zero-length text, or an empty batch.
    #[error("embedding input is empty")]
    EmptyInput,
    /// More texts than the provider accepts in one request.
    #[error("embedding batch of {size} exceeds provider maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },
}

/// Request-level failures surfaced verbatim to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// Referenced library, upload, or blob does not exist or is deleted.
    #[error("not found: {0}")]
    NotFound(String),
    /// Identical content already uploaded to the same library version.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Malformed request or unsupported file type.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

/// Coarse error class, used by frontends to pick an exit code or status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidParams,
    Embedding,
    Internal,
}

/// Classify an `anyhow::Error` by the typed error it carries, if any.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    if let Some(e) = err.downcast_ref::<IndexError>() {
        return match e {
            IndexError::NotFound(_) => ErrorKind::NotFound,
            IndexError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            IndexError::InvalidParams(_) => ErrorKind::InvalidParams,
        };
    }
    if err.downcast_ref::<EmbedError>().is_some() {
        return ErrorKind::Embedding;
    }
    ErrorKind::Internal
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_survives_context() {
        let err = Err::<(), _>(IndexError::NotFound("library 7".into()))
            .context("loading library")
            .unwrap_err();
        assert_eq!(classify(&err), ErrorKind::NotFound);
    }

    #[test]
    fn test_classify_embedding_and_plain_errors() {
        let err = anyhow::Error::new(EmbedError::BatchTooLarge { size: 3, max: 2 });
        assert_eq!(classify(&err), ErrorKind::Embedding);
        assert_eq!(
            err.to_string(),
            "embedding batch of 3 exceeds provider maximum of 2"
        );
        assert_eq!(classify(&anyhow::anyhow!("disk full")), ErrorKind::Internal);
    }
}
