//! Storage abstractions for Folio.
//!
//! Two traits split the persistent state:
//!
//! - [`VectorIndex`]: chunk embeddings per book, bound to one
//!   [`EmbeddingModel`] generation, with book-scoped cosine search.
//! - [`BookStore`]: book records, chunks, ingestion status, and cached
//!   personality profiles.
//!
//! Both are async (via `async-trait`) so the SQLite backend in the app crate
//! and the in-memory backend in [`memory`] share one interface. Implementations
//! must be `Send + Sync`.

pub mod memory;

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{Book, Chunk, EmbeddingModel, IngestStatus, PersonalityProfile};

/// One embedding to store.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub book_id: String,
    pub chunk_id: String,
    pub position: i64,
    pub content_hash: String,
    pub vector: Vec<f32>,
}

/// A scored search result.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub chunk_id: String,
    pub book_id: String,
    pub position: i64,
    pub content_hash: String,
    /// Cosine similarity with the query.
    pub score: f64,
}

/// Summary counts for an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub model: String,
    pub dims: usize,
    pub books: usize,
    pub chunks: usize,
}

/// Book-partitioned nearest-neighbour index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace embeddings |
/// | [`search`](VectorIndex::search) | Cosine search scoped to a book set |
/// | [`delete`](VectorIndex::delete) | Hard-delete every entry of a book |
/// | [`indexed_chunks`](VectorIndex::indexed_chunks) | Chunk id → content hash for a book |
/// | [`remove`](VectorIndex::remove) | Delete specific chunk ids |
/// | [`stats`](VectorIndex::stats) | Book/chunk counts |
///
/// Every vector written or queried must have exactly `model().dims`
/// components, otherwise the call fails with [`Error::DimensionMismatch`].
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// The embedding generation this index is bound to.
    fn model(&self) -> EmbeddingModel;

    /// Insert or replace entries, keyed by `(book_id, chunk_id)`.
    ///
    /// The whole batch is validated before anything is written.
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()>;

    /// Return up to `top_k` hits from the given books, ranked by
    /// [`rank_hits`]. An empty book set yields no results.
    async fn search(
        &self,
        query: &[f32],
        book_ids: &BTreeSet<String>,
        top_k: usize,
    ) -> Result<Vec<IndexHit>>;

    /// Remove every entry for a book. Returns the number removed.
    async fn delete(&self, book_id: &str) -> Result<usize>;

    /// Chunk ids currently indexed for a book, mapped to their content hash.
    async fn indexed_chunks(&self, book_id: &str) -> Result<HashMap<String, String>>;

    /// Remove specific chunks of a book. Returns the number removed.
    async fn remove(&self, book_id: &str, chunk_ids: &[String]) -> Result<usize>;

    async fn stats(&self) -> Result<IndexStats>;
}

/// Book metadata, chunk text, ingestion status, and profile cache.
#[async_trait]
pub trait BookStore: Send + Sync {
    async fn upsert_book(&self, book: &Book) -> Result<()>;

    async fn get_book(&self, id: &str) -> Result<Option<Book>>;

    /// Delete a book and cascade to its chunks, status, and profiles.
    /// Returns `false` if the book did not exist.
    async fn delete_book(&self, id: &str) -> Result<bool>;

    /// Replace all chunks of a book.
    async fn replace_chunks(&self, book_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Fetch chunks by id, in the order requested. Unknown ids are skipped.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// All chunks of a book in position order.
    async fn chunks_for_book(&self, book_id: &str) -> Result<Vec<Chunk>>;

    async fn set_status(&self, book_id: &str, status: &IngestStatus) -> Result<()>;

    async fn get_status(&self, book_id: &str) -> Result<Option<IngestStatus>>;

    /// Replace the cached profiles of a book (book profile and characters).
    async fn save_profiles(&self, book_id: &str, profiles: &[PersonalityProfile]) -> Result<()>;

    async fn get_profiles(&self, book_id: &str) -> Result<Vec<PersonalityProfile>>;
}

/// Reject a vector whose length differs from the model's dims.
pub fn check_dims(model: &EmbeddingModel, vector: &[f32], context: &str) -> Result<()> {
    if vector.len() != model.dims {
        return Err(Error::DimensionMismatch {
            context: context.to_string(),
            expected: model.dims,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Order hits by score descending, then earlier position, lower book id,
/// and lower chunk id.
pub fn compare_hits(a: &IndexHit, b: &IndexHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.position.cmp(&b.position))
        .then_with(|| a.book_id.cmp(&b.book_id))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Sort hits with [`compare_hits`] and keep the first `top_k`.
pub fn rank_hits(hits: &mut Vec<IndexHit>, top_k: usize) {
    hits.sort_by(compare_hits);
    hits.truncate(top_k);
}
