//! Upload intake.
//!
//! Validates a new document, persists its raw bytes, records the upload in
//! `pending`, and hands it to the [`IngestExecutor`]. The call returns as
//! soon as ingestion is scheduled.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use docsift_core::error::IndexError;
use docsift_core::models::{DocumentUpload, NewUpload};
use docsift_core::parse::detect_file_type;
use docsift_core::progress::IngestEvent;
use docsift_core::storage::{content_hash, storage_key, BlobStorage};
use docsift_core::store::Store;

use crate::executor::IngestExecutor;

/// An accepted upload and, when ingestion was scheduled, its progress stream.
pub struct Accepted {
    pub upload: DocumentUpload,
    pub progress: Option<mpsc::Receiver<IngestEvent>>,
}

pub struct UploadService {
    store: Arc<dyn Store>,
    storage: Arc<dyn BlobStorage>,
    executor: Arc<IngestExecutor>,
    prefix: String,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn BlobStorage>,
        executor: Arc<IngestExecutor>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            storage,
            executor,
            prefix: prefix.into(),
        }
    }

    pub fn executor(&self) -> &Arc<IngestExecutor> {
        &self.executor
    }

    pub async fn upload(
        &self,
        library_id: i64,
        version: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<Accepted> {
        let library = self
            .store
            .get_library(library_id)
            .await?
            .ok_or_else(|| IndexError::NotFound(format!("library {}", library_id)))?;
        if version.trim().is_empty() {
            return Err(IndexError::InvalidParams("version must not be empty".into()).into());
        }
        let file_type = detect_file_type(filename)?;

        let hash = content_hash(bytes);
        if let Some(existing) = self
            .store
            .find_upload_by_hash(library.id, version, &hash)
            .await?
        {
            return Err(IndexError::AlreadyExists(format!(
                "{} is identical to upload {} in {} {}",
                filename, existing.id, library.name, version
            ))
            .into());
        }

        let key = storage_key(&self.prefix, &library.name, version, &hash, filename);
        let stored = self
            .storage
            .upload(&key, bytes, file_type.content_type())
            .await?;

        let title = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename)
            .to_string();
        let inserted = self
            .store
            .insert_upload(&NewUpload {
                library_id: library.id,
                version: version.to_string(),
                title,
                filename: filename.to_string(),
                storage_key: stored.key.clone(),
                file_type,
                file_size: stored.size as i64,
                content_hash: hash.clone(),
            })
            .await;
        let upload = match inserted {
            Ok(upload) => upload,
            Err(e) => {
                self.discard_blob(library.id, version, &hash, &stored.key).await;
                return Err(e);
            }
        };
        info!(
            upload_id = upload.id,
            library = %library.name,
            version,
            bytes = upload.file_size,
            "upload accepted"
        );

        let progress = self.executor.submit(upload.id)?;
        Ok(Accepted { upload, progress })
    }

    /// Remove a blob whose upload row was never written, unless a
    /// concurrent upload of the same content recorded the same key.
    async fn discard_blob(&self, library_id: i64, version: &str, hash: &str, key: &str) {
        let shared = match self.store.find_upload_by_hash(library_id, version, hash).await {
            Ok(existing) => existing.is_some_and(|u| u.storage_key == key),
            Err(_) => true,
        };
        if shared {
            return;
        }
        if let Err(e) = self.storage.delete(key).await {
            warn!(key, error = %e, "could not remove orphaned upload blob");
        }
    }

    /// Soft-delete an upload and its chunks. The raw file is removed too.
    pub async fn delete(&self, upload_id: i64) -> Result<DocumentUpload> {
        let upload = self
            .store
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| IndexError::NotFound(format!("upload {}", upload_id)))?;
        if !self.store.delete_upload(upload_id).await? {
            return Err(IndexError::NotFound(format!("upload {}", upload_id)).into());
        }
        self.executor
            .indexer()
            .invalidate_results(upload.library_id, &upload.version);
        self.storage.delete(&upload.storage_key).await?;
        info!(upload_id, "upload deleted");
        Ok(upload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docsift_core::embedding::EmbeddingProvider;
    use docsift_core::error::{classify, ErrorKind};
    use docsift_core::models::{ChunkStatus, UploadStatus};
    use docsift_core::pipeline::{Indexer, IndexerOptions};
    use docsift_core::storage::MemoryStorage;
    use docsift_core::store::memory::InMemoryStore;

    struct Flat;

    #[async_trait]
    impl EmbeddingProvider for Flat {
        fn model_name(&self) -> &str {
            "flat"
        }
        fn dims(&self) -> usize {
            2
        }
        fn max_batch_size(&self) -> usize {
            16
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0, 1.0]).collect())
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        storage: Arc<MemoryStorage>,
        service: UploadService,
        library_id: i64,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let storage = Arc::new(MemoryStorage::new());
        let indexer = Arc::new(Indexer::new(
            store.clone(),
            storage.clone(),
            Arc::new(Flat),
            IndexerOptions::default(),
        ));
        let executor = Arc::new(IngestExecutor::new(indexer, 4));
        let service = UploadService::new(store.clone(), storage.clone(), executor, "docs");
        let library_id = store.create_library("My Lib").await.unwrap().id;
        Harness {
            store,
            storage,
            service,
            library_id,
        }
    }

    #[tokio::test]
    async fn test_upload_stores_and_indexes() {
        let h = harness().await;
        let accepted = h
            .service
            .upload(h.library_id, "2.0", "guide.md", b"# Guide\n\nHello there.")
            .await
            .unwrap();
        assert_eq!(accepted.upload.status, UploadStatus::Pending);
        assert_eq!(accepted.upload.title, "guide");
        let hash = content_hash(b"# Guide\n\nHello there.");
        assert_eq!(
            accepted.upload.storage_key,
            format!("docs/My_Lib/2.0/{}-guide.md", &hash[..16])
        );
        assert!(accepted.progress.is_some());

        h.service.executor().wait_idle().await;
        let upload = h.store.get_upload(accepted.upload.id).await.unwrap().unwrap();
        assert_eq!(upload.status, UploadStatus::Completed);
        assert!(upload.chunk_count > 0);
        let raw = h.storage.download(&upload.storage_key).await.unwrap();
        assert_eq!(raw, b"# Guide\n\nHello there.");
    }

    #[tokio::test]
    async fn test_upload_rejections() {
        let h = harness().await;

        let err = h.service.upload(999, "1", "a.md", b"x").await.err().unwrap();
        assert_eq!(classify(&err), ErrorKind::NotFound);

        let err = h
            .service
            .upload(h.library_id, "1", "a.exe", b"x")
            .await
            .err()
            .unwrap();
        assert_eq!(classify(&err), ErrorKind::InvalidParams);

        h.service
            .upload(h.library_id, "1", "a.md", b"same bytes")
            .await
            .unwrap();
        let err = h
            .service
            .upload(h.library_id, "1", "b.md", b"same bytes")
            .await
            .err()
            .unwrap();
        assert_eq!(classify(&err), ErrorKind::AlreadyExists);

        // Same content under another version is a distinct document.
        h.service
            .upload(h.library_id, "2", "b.md", b"same bytes")
            .await
            .unwrap();
        h.service.executor().wait_idle().await;
    }

    #[tokio::test]
    async fn test_same_filename_keeps_separate_blobs() {
        let h = harness().await;
        let first = h
            .service
            .upload(h.library_id, "1", "guide.md", b"Runtime drives futures.")
            .await
            .unwrap();
        let second = h
            .service
            .upload(h.library_id, "1", "guide.md", b"Channels pass messages.")
            .await
            .unwrap();
        h.service.executor().wait_idle().await;

        assert_ne!(first.upload.storage_key, second.upload.storage_key);
        h.service.delete(second.upload.id).await.unwrap();
        let raw = h.storage.download(&first.upload.storage_key).await.unwrap();
        assert_eq!(raw, b"Runtime drives futures.");
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_accept_one() {
        let h = harness().await;
        let (a, b) = tokio::join!(
            h.service.upload(h.library_id, "1", "a.md", b"Same body."),
            h.service.upload(h.library_id, "1", "a.md", b"Same body."),
        );
        let accepted: Vec<_> = [a, b].into_iter().filter_map(|r| r.ok()).collect();
        assert_eq!(accepted.len(), 1);
        h.service.executor().wait_idle().await;

        let raw = h.storage.download(&accepted[0].upload.storage_key).await.unwrap();
        assert_eq!(raw, b"Same body.");
    }

    #[tokio::test]
    async fn test_delete_soft_deletes_chunks_and_blob() {
        let h = harness().await;
        let accepted = h
            .service
            .upload(h.library_id, "1", "a.md", b"Some text to index.")
            .await
            .unwrap();
        h.service.executor().wait_idle().await;

        h.service.delete(accepted.upload.id).await.unwrap();
        let upload = h.store.get_upload(accepted.upload.id).await.unwrap().unwrap();
        assert_eq!(upload.status, UploadStatus::Deleted);
        assert!(h
            .store
            .all_chunks()
            .unwrap()
            .iter()
            .all(|c| c.status == ChunkStatus::Deleted));
        assert!(h.storage.download(&upload.storage_key).await.is_err());

        let err = h.service.delete(accepted.upload.id).await.err().unwrap();
        assert_eq!(classify(&err), ErrorKind::NotFound);
        let err = h.service.delete(4242).await.err().unwrap();
        assert_eq!(classify(&err), ErrorKind::NotFound);
    }
}
