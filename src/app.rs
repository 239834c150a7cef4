//! Service wiring shared by the CLI and the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use folio_core::embedding::{EmbeddingProvider, GenerationProvider};
use folio_core::generation::GenerationOrchestrator;
use folio_core::personality::PersonalityExtractor;
use folio_core::pipeline::Pipeline;
use folio_core::retrieval::Retriever;
use folio_core::store::{BookStore, IndexStats, VectorIndex};

use crate::chat::{ChatService, ChatSettings};
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::create_generator;
use crate::ingest::IngestService;
use crate::migrate::migrate_pool;
use crate::sqlite_store::{SqliteBookStore, SqliteIndex};

/// Ingestion and chat services over one set of backends.
pub struct App {
    pub config: Config,
    pub store: Arc<dyn BookStore>,
    pub index: Arc<dyn VectorIndex>,
    pub ingest: Arc<IngestService>,
    pub chat: ChatService,
}

impl App {
    /// Open the configured database and providers.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;

        let pool = db::connect(&config).await?;
        migrate_pool(&pool).await?;
        let index = SqliteIndex::open(pool.clone(), embedder.model())
            .await
            .context("Failed to open vector index")?;
        let store = SqliteBookStore::new(pool);

        Ok(Self::with_backends(
            config,
            Arc::new(store),
            Arc::new(index),
            embedder,
            generator,
        ))
    }

    /// Wire services over explicit backends and providers.
    pub fn with_backends(
        config: Config,
        store: Arc<dyn BookStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        let extractor = PersonalityExtractor::new(generator.clone(), config.personality.params());
        let pipeline = Pipeline::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            extractor,
            config.ingest_params(),
        );
        let retriever = Retriever::new(
            embedder,
            index.clone(),
            store.clone(),
            config.retrieval.params(),
        );
        let orchestrator = GenerationOrchestrator::new(generator, config.retrieval.history_window);
        let settings = ChatSettings {
            top_k: config.retrieval.top_k,
            retrieval_timeout: Duration::from_millis(config.retrieval.timeout_ms),
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
        };

        Self {
            ingest: IngestService::new(pipeline),
            chat: ChatService::new(store.clone(), retriever, orchestrator, settings),
            store,
            index,
            config,
        }
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        Ok(self.index.stats().await?)
    }
}
