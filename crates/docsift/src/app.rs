//! Process-wide wiring of backends and services.
//!
//! [`App::open`] connects to the database, applies the schema, builds the
//! configured embedder, and assembles the indexer, the ingestion executor,
//! and the upload and search services on top of them. The indexer and the
//! search service share one search-result cache. Everything is held
//! by `Arc` and torn down with [`App::close`].

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use docsift_core::embedding::EmbeddingProvider;
use docsift_core::error::IndexError;
use docsift_core::models::Library;
use docsift_core::pipeline::Indexer;
use docsift_core::search::ResultCache;
use docsift_core::storage::BlobStorage;
use docsift_core::store::Store;

use crate::cache::MokaResultCache;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::executor::IngestExecutor;
use crate::migrate::migrate_pool;
use crate::search::SearchService;
use crate::sqlite_store::SqliteStore;
use crate::storage::LocalStorage;
use crate::uploads::UploadService;
use crate::writer::{AccessSink, AccessWriter, BufferedWriter};

pub struct App {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub storage: Arc<dyn BlobStorage>,
    pub indexer: Arc<Indexer>,
    pub executor: Arc<IngestExecutor>,
    pub uploads: UploadService,
    pub search: SearchService,
    pub access: AccessWriter,
}

impl App {
    /// Open with the embedder described by `config.embedding`.
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        Self::with_embedder(config, embedder).await
    }

    /// Open with an explicit embedder.
    pub async fn with_embedder(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate_pool(&pool).await?;
        let store = Arc::new(SqliteStore::new(pool));
        let storage: Arc<dyn BlobStorage> = Arc::new(LocalStorage::new(config.storage.root.clone()));

        let results: Option<Arc<dyn ResultCache>> = if config.retrieval.result_cache_enabled() {
            Some(Arc::new(MokaResultCache::new(
                config.retrieval.result_cache_capacity,
                Duration::from_secs(config.retrieval.result_cache_ttl_secs),
            )))
        } else {
            None
        };

        let mut indexer = Indexer::new(
            store.clone(),
            storage.clone(),
            embedder.clone(),
            config.indexer_options(),
        );
        if let Some(cache) = &results {
            indexer = indexer.with_result_cache(cache.clone());
        }
        let indexer = Arc::new(indexer);
        let executor = Arc::new(IngestExecutor::new(
            indexer.clone(),
            config.ingest.max_concurrent,
        ));
        let uploads = UploadService::new(
            store.clone(),
            storage.clone(),
            executor.clone(),
            config.storage.prefix.clone(),
        );
        let search = SearchService::new(
            store.clone(),
            embedder,
            config.retrieval.search_params(),
            results,
        );
        let access: AccessWriter =
            BufferedWriter::init(&config.writer, Arc::new(AccessSink::new(store.clone())));

        Ok(Self {
            config: config.clone(),
            store,
            storage,
            indexer,
            executor,
            uploads,
            search,
            access,
        })
    }

    /// Resolve a library given by name or numeric id.
    pub async fn resolve_library(&self, name_or_id: &str) -> Result<Library> {
        let libraries = self.store.list_libraries().await?;
        let by_id = name_or_id.parse::<i64>().ok();
        libraries
            .into_iter()
            .find(|l| l.name == name_or_id || Some(l.id) == by_id)
            .ok_or_else(|| IndexError::NotFound(format!("library '{}'", name_or_id)).into())
    }

    /// Let running ingestions finish, flush buffered writes, close the pool.
    pub async fn close(self) -> Result<()> {
        self.executor.wait_idle().await;
        self.access.close().await?;
        self.store.pool().close().await;
        Ok(())
    }
}
