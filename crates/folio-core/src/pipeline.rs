//! Ingestion pipeline: chunk → embed in batches → index → extract profiles.
//!
//! Stages run strictly in order for one book and report progress through
//! [`IngestStatus`]:
//!
//! ```text
//! Pending → Indexing → ExtractingPersonality → Ready
//!              └──────────────┴──────────────→ Failed(kind, message)
//! ```
//!
//! Embeddings are upserted batch by batch, so a chat running while a book is
//! still indexing already sees the chunks indexed so far. Re-ingestion is
//! incremental: chunks whose content hash is already indexed are skipped,
//! vectors of chunk ids that no longer exist or whose text changed are
//! removed from the index before the new text is stored, and profiles
//! are only re-extracted when the indexed content changed. A failure keeps
//! whatever was written before it.
//!
//! The pipeline does not serialize concurrent runs for the same book; the
//! caller holds a per-book lock around [`Pipeline::run`] and
//! [`Pipeline::delete`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::chunk::{chunk_text, ChunkingParams};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::models::{Book, Chunk, IngestStatus};
use crate::personality::PersonalityExtractor;
use crate::store::{check_dims, BookStore, IndexEntry, VectorIndex};

#[derive(Debug, Clone, PartialEq)]
pub struct IngestParams {
    pub chunking: ChunkingParams,
    /// Texts per embedding request.
    pub batch_size: usize,
}

impl Default for IngestParams {
    fn default() -> Self {
        Self {
            chunking: ChunkingParams::default(),
            batch_size: 64,
        }
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub book_id: String,
    pub chunks: usize,
    pub embedded: usize,
    pub skipped: usize,
    pub removed: usize,
    pub characters: usize,
    pub omitted_characters: usize,
    /// Profiles were reused because nothing in the index changed.
    pub profiles_reused: bool,
}

/// Wires the chunker, embedder, index, extractor, and store together.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn BookStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    extractor: PersonalityExtractor,
    params: IngestParams,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn BookStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: PersonalityExtractor,
        params: IngestParams,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            extractor,
            params,
        }
    }

    pub fn store(&self) -> &Arc<dyn BookStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Record the book and acknowledge with `Pending`.
    pub async fn register(&self, book: &Book) -> Result<IngestStatus> {
        if book.text.trim().is_empty() {
            return Err(Error::MalformedInput("book text is empty".to_string()));
        }
        let mut record = book.clone();
        if let Some(existing) = self.store.get_book(&book.id).await? {
            record.chunk_ids = existing.chunk_ids;
            record.character_ids = existing.character_ids;
        }
        self.store.upsert_book(&record).await?;
        self.store
            .set_status(&book.id, &IngestStatus::Pending)
            .await?;
        Ok(IngestStatus::Pending)
    }

    /// Run every stage for a registered book.
    ///
    /// On error the status becomes `Failed(kind, message)` and the error is
    /// returned.
    pub async fn run(&self, book_id: &str) -> Result<IngestReport> {
        match self.run_stages(book_id).await {
            Ok(report) => {
                tracing::info!(
                    book_id,
                    chunks = report.chunks,
                    embedded = report.embedded,
                    skipped = report.skipped,
                    removed = report.removed,
                    characters = report.characters,
                    "ingestion complete"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(book_id, error = %e, "ingestion failed");
                if let Err(status_err) = self
                    .store
                    .set_status(book_id, &IngestStatus::failed(&e))
                    .await
                {
                    tracing::error!(book_id, error = %status_err, "could not record failed status");
                }
                Err(e)
            }
        }
    }

    /// Register and run in one call.
    pub async fn ingest(&self, book: &Book) -> Result<IngestReport> {
        self.register(book).await?;
        self.run(&book.id).await
    }

    /// Remove a book from the index and the store.
    ///
    /// Returns `false` if the store had no such book.
    pub async fn delete(&self, book_id: &str) -> Result<bool> {
        let removed = self.index.delete(book_id).await?;
        let existed = self.store.delete_book(book_id).await?;
        tracing::info!(book_id, vectors = removed, existed, "book deleted");
        Ok(existed)
    }

    async fn run_stages(&self, book_id: &str) -> Result<IngestReport> {
        let mut book = self
            .store
            .get_book(book_id)
            .await?
            .ok_or_else(|| Error::BookNotFound(book_id.to_string()))?;

        self.store.set_status(book_id, &IngestStatus::Indexing).await?;

        let index_model = self.index.model();
        let embed_model = self.embedder.model();
        if index_model != embed_model {
            return Err(Error::ModelMismatch {
                index: format!("{}/{}", index_model.name, index_model.dims),
                query: format!("{}/{}", embed_model.name, embed_model.dims),
            });
        }

        let chunks = chunk_text(book_id, &book.text, &self.params.chunking)?;

        // Vectors for ids that are gone or whose text changed must leave the
        // index before the new text lands in the store.
        let mut indexed = self.index.indexed_chunks(book_id).await?;
        let current: HashMap<&str, &str> = chunks
            .iter()
            .map(|c| (c.id.as_str(), c.hash.as_str()))
            .collect();
        let (gone, changed): (Vec<String>, Vec<String>) = indexed
            .iter()
            .filter(|(id, hash)| current.get(id.as_str()) != Some(&hash.as_str()))
            .map(|(id, _)| id.clone())
            .partition(|id| !current.contains_key(id.as_str()));
        let removed = gone.len();
        let outdated: Vec<String> = gone.into_iter().chain(changed).collect();
        if !outdated.is_empty() {
            self.index.remove(book_id, &outdated).await?;
            for id in &outdated {
                indexed.remove(id);
            }
        }

        self.store.replace_chunks(book_id, &chunks).await?;
        book.chunk_ids = chunks.iter().map(|c| c.id.clone()).collect();
        self.store.upsert_book(&book).await?;

        let pending: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| indexed.get(&c.id) != Some(&c.hash))
            .collect();
        let skipped = chunks.len() - pending.len();

        let mut embedded = 0;
        for batch in pending.chunks(self.params.batch_size.max(1)) {
            self.embed_batch(book_id, batch).await?;
            embedded += batch.len();
            tracing::debug!(book_id, embedded, total = pending.len(), "embedded batch");
        }

        self.store
            .set_status(book_id, &IngestStatus::ExtractingPersonality)
            .await?;

        let existing_profiles = self.store.get_profiles(book_id).await?;
        let profiles_reused = embedded == 0 && removed == 0 && !existing_profiles.is_empty();
        let (characters, omitted_characters) = if profiles_reused {
            let characters = existing_profiles
                .iter()
                .filter(|p| p.target.character_id().is_some())
                .count();
            (characters, 0)
        } else {
            let extraction = self.extractor.extract_all(book_id, &chunks).await?;
            self.store
                .save_profiles(book_id, &extraction.profiles())
                .await?;
            book.character_ids = extraction
                .characters
                .iter()
                .filter_map(|p| p.target.character_id())
                .collect();
            self.store.upsert_book(&book).await?;
            (extraction.characters.len(), extraction.omitted.len())
        };

        self.store.set_status(book_id, &IngestStatus::Ready).await?;

        Ok(IngestReport {
            book_id: book_id.to_string(),
            chunks: chunks.len(),
            embedded,
            skipped,
            removed,
            characters,
            omitted_characters,
            profiles_reused,
        })
    }

    async fn embed_batch(&self, book_id: &str, batch: &[&Chunk]) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_texts(&texts).await?;
        if vectors.len() != batch.len() {
            return Err(Error::ProviderUnavailable(format!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )));
        }

        let model = self.index.model();
        let mut entries = Vec::with_capacity(batch.len());
        for (chunk, vector) in batch.iter().zip(vectors) {
            check_dims(&model, &vector, &chunk.id)?;
            entries.push(IndexEntry {
                book_id: book_id.to_string(),
                chunk_id: chunk.id.clone(),
                position: chunk.position,
                content_hash: chunk.hash.clone(),
                vector,
            });
        }
        self.index.upsert(&entries).await
    }
}
