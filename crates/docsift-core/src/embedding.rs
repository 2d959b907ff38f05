//! Embedding provider trait, batch contract, and vector utilities.
//!
//! Concrete providers (OpenAI, Ollama, fastembed) live in the `docsift`
//! app crate. Every provider enforces the same contract through
//! [`check_batch`]: an empty batch or an empty text is
//! [`EmbedError::EmptyInput`], and more texts than
//! [`max_batch_size`](EmbeddingProvider::max_batch_size) is
//! [`EmbedError::BatchTooLarge`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::error::EmbedError;

/// An embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Largest number of texts accepted by one [`embed_batch`](Self::embed_batch) call.
    fn max_batch_size(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(EmbedError::EmptyInput.into());
        }
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow!("embedding provider returned no vector"))
    }
}

/// Validate a batch against the provider contract.
pub fn check_batch(texts: &[String], max_batch_size: usize) -> Result<(), EmbedError> {
    if texts.is_empty() || texts.iter().any(|t| t.is_empty()) {
        return Err(EmbedError::EmptyInput);
    }
    if texts.len() > max_batch_size {
        return Err(EmbedError::BatchTooLarge {
            size: texts.len(),
            max: max_batch_size,
        });
    }
    Ok(())
}

/// Verify a provider response has one vector per input.
pub fn check_response(expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected {
        bail!(
            "embedding provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        );
    }
    Ok(())
}

/// Embed any number of texts by slicing them into provider-sized batches.
///
/// Batches run sequentially; the first failure aborts the whole call.
pub async fn embed_all(provider: &dyn EmbeddingProvider, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let batch = provider.max_batch_size().max(1);
    let mut out = Vec::with_capacity(texts.len());
    for slice in texts.chunks(batch) {
        let vectors = provider.embed_batch(slice).await?;
        check_response(slice.len(), &vectors)?;
        out.extend(vectors);
    }
    Ok(out)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use docsift_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance (`1 - similarity`), in `[0.0, 2.0]`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b) as f64
}
