//! Local-disk [`BlobStorage`].
//!
//! Objects are files under `[storage].root`, addressed by their key as a
//! relative path. Keys come from [`storage_key`](docsift_core::storage::storage_key),
//! whose segments are already sanitized; keys that would escape the root
//! are rejected anyway.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use docsift_core::error::IndexError;
use docsift_core::storage::{content_hash, BlobStorage, StoredObject};

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(IndexError::InvalidParams(format!("invalid storage key '{}'", key)).into());
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStorage for LocalStorage {
    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<StoredObject> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(StoredObject {
            key: key.to_string(),
            etag: content_hash(bytes),
            size: bytes.len() as u64,
            content_type: content_type.to_string(),
        })
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IndexError::NotFound(format!("object {}", key)).into())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsift_core::error::{classify, ErrorKind};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_download_delete() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());

        let stored = storage
            .upload("docs/lib/1.0/guide.md", b"# Guide", "text/markdown")
            .await
            .unwrap();
        assert_eq!(stored.size, 7);
        assert_eq!(stored.etag, content_hash(b"# Guide"));
        assert!(tmp.path().join("docs/lib/1.0/guide.md").exists());

        assert_eq!(
            storage.download("docs/lib/1.0/guide.md").await.unwrap(),
            b"# Guide"
        );

        storage.delete("docs/lib/1.0/guide.md").await.unwrap();
        let err = storage.download("docs/lib/1.0/guide.md").await.unwrap_err();
        assert_eq!(classify(&err), ErrorKind::NotFound);

        // Deleting twice is fine.
        storage.delete("docs/lib/1.0/guide.md").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        for key in ["../outside.md", "/etc/passwd", ""] {
            let err = storage.upload(key, b"x", "text/plain").await.unwrap_err();
            assert_eq!(classify(&err), ErrorKind::InvalidParams, "key {:?}", key);
        }
    }
}
