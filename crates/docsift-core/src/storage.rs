//! Raw source-file storage contract.
//!
//! The upload flow persists the original bytes before chunking; the
//! pipeline fetches them back by key. Backends (local disk in the app
//! crate, [`MemoryStorage`] here) implement [`BlobStorage`].

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::IndexError;

/// Result of a successful [`BlobStorage::upload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    pub key: String,
    /// Hex SHA-256 of the stored bytes.
    pub etag: String,
    pub size: u64,
    pub content_type: String,
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object.
    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<StoredObject>;

    /// Fetch the bytes stored under `key`; [`IndexError::NotFound`] if absent.
    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove the object under `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Hex SHA-256 digest, used both as etag and as upload dedup hash.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex digits of the content hash that prefix the stored filename.
const KEY_HASH_LEN: usize = 16;

/// Storage key `{prefix}/{library}/{version}/{hash}-{filename}`, where
/// `hash` is the leading part of the content hash, with each segment
/// sanitized so it cannot escape its directory.
///
/// Two uploads of the same filename with different content in one
/// version get distinct keys.
pub fn storage_key(prefix: &str, library: &str, version: &str, hash: &str, filename: &str) -> String {
    let filename = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let hash: String = hash.chars().take(KEY_HASH_LEN).collect();
    format!(
        "{}/{}/{}/{}-{}",
        sanitize_segment(prefix),
        sanitize_segment(library),
        sanitize_segment(version),
        sanitize_segment(&hash),
        sanitize_segment(filename)
    )
}

/// Replace everything outside `[A-Za-z0-9._-]` with `_` and neutralize
/// dot-only segments.
pub fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// In-memory blob storage.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStorage for MemoryStorage {
    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<StoredObject> {
        self.objects
            .write()
            .map_err(|_| anyhow!("memory storage lock poisoned"))?
            .insert(key.to_string(), bytes.to_vec());
        Ok(StoredObject {
            key: key.to_string(),
            etag: content_hash(bytes),
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
        })
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .map_err(|_| anyhow!("memory storage lock poisoned"))?
            .get(key)
            .cloned()
            .ok_or_else(|| IndexError::NotFound(format!("object {}", key)).into())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| anyhow!("memory storage lock poisoned"))?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ErrorKind};

    #[test]
    fn test_storage_key_sanitizes_segments() {
        assert_eq!(
            storage_key("docs", "My Lib", "v1.2/beta", "0123456789abcdef99", "../../etc/passwd"),
            "docs/My_Lib/v1.2_beta/0123456789abcdef-passwd"
        );
        assert_eq!(
            storage_key("docs", "..", "1.0", "ab/cd", "a b.md"),
            "docs/_/1.0/ab_cd-a_b.md"
        );
    }

    #[test]
    fn test_storage_key_distinguishes_content() {
        let first = storage_key("docs", "lib", "1.0", &content_hash(b"one"), "guide.md");
        let second = storage_key("docs", "lib", "1.0", &content_hash(b"two"), "guide.md");
        assert_ne!(first, second);
        assert!(first.ends_with("-guide.md"));
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_memory_storage_roundtrip_and_missing() {
        let storage = MemoryStorage::new();
        let obj = storage.upload("k/a.md", b"hello", "text/markdown").await.unwrap();
        assert_eq!(obj.size, 5);
        assert_eq!(obj.etag, content_hash(b"hello"));
        assert_eq!(storage.download("k/a.md").await.unwrap(), b"hello");

        storage.delete("k/a.md").await.unwrap();
        storage.delete("k/a.md").await.unwrap();
        let err = storage.download("k/a.md").await.unwrap_err();
        assert_eq!(classify(&err), ErrorKind::NotFound);
    }
}
