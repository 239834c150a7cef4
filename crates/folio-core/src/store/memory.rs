//! In-memory [`VectorIndex`] and [`BookStore`] implementations.
//!
//! The index keeps one copy-on-write partition per book: a writer builds a
//! new `Vec` from the current snapshot and swaps the `Arc` in under a brief
//! write lock, so readers holding the old `Arc` keep a consistent view while
//! the write is in progress. Writers for the same book are serialized by a
//! per-book mutex.
//!
//! Search is brute-force cosine similarity over the selected partitions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::models::{Book, Chunk, EmbeddingModel, IngestStatus, PersonalityProfile};

use super::{check_dims, rank_hits, BookStore, IndexEntry, IndexHit, IndexStats, VectorIndex};

type Partition = Arc<Vec<IndexEntry>>;

/// In-memory vector index bound to one embedding model.
pub struct InMemoryIndex {
    model: EmbeddingModel,
    partitions: RwLock<HashMap<String, Partition>>,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InMemoryIndex {
    pub fn new(model: EmbeddingModel) -> Self {
        Self {
            model,
            partitions: RwLock::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn writer(&self, book_id: &str) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers
            .entry(book_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a book's writer lock unless another writer still holds it.
    fn release_writer(&self, book_id: &str) {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        if writers
            .get(book_id)
            .is_some_and(|w| Arc::strong_count(w) == 1)
        {
            writers.remove(book_id);
        }
    }

    fn snapshot(&self, book_id: &str) -> Option<Partition> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions.get(book_id).cloned()
    }

    fn publish(&self, book_id: &str, entries: Vec<IndexEntry>) {
        let mut partitions = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        if entries.is_empty() {
            partitions.remove(book_id);
        } else {
            partitions.insert(book_id.to_string(), Arc::new(entries));
        }
    }

    /// Rewrite one book's partition under its writer lock.
    fn rewrite<F>(&self, book_id: &str, edit: F) -> usize
    where
        F: FnOnce(&mut Vec<IndexEntry>) -> usize,
    {
        let writer = self.writer(book_id);
        let _guard = writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self
            .snapshot(book_id)
            .map(|p| p.as_ref().clone())
            .unwrap_or_default();
        let changed = edit(&mut entries);
        if changed > 0 {
            self.publish(book_id, entries);
        }
        changed
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn model(&self) -> EmbeddingModel {
        self.model.clone()
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        for entry in entries {
            check_dims(&self.model, &entry.vector, &entry.chunk_id)?;
        }

        let mut by_book: HashMap<&str, Vec<&IndexEntry>> = HashMap::new();
        for entry in entries {
            by_book.entry(entry.book_id.as_str()).or_default().push(entry);
        }

        for (book_id, batch) in by_book {
            self.rewrite(book_id, |stored| {
                for entry in &batch {
                    match stored.iter_mut().find(|e| e.chunk_id == entry.chunk_id) {
                        Some(existing) => *existing = (*entry).clone(),
                        None => stored.push((*entry).clone()),
                    }
                }
                stored.sort_by_key(|e| e.position);
                batch.len()
            });
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        book_ids: &BTreeSet<String>,
        top_k: usize,
    ) -> Result<Vec<IndexHit>> {
        check_dims(&self.model, query, "query")?;
        if book_ids.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let selected: Vec<Partition> = {
            let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
            book_ids
                .iter()
                .filter_map(|id| partitions.get(id).cloned())
                .collect()
        };

        let mut hits: Vec<IndexHit> = selected
            .iter()
            .flat_map(|p| p.iter())
            .map(|e| IndexHit {
                chunk_id: e.chunk_id.clone(),
                book_id: e.book_id.clone(),
                position: e.position,
                content_hash: e.content_hash.clone(),
                score: cosine_similarity(query, &e.vector) as f64,
            })
            .collect();

        rank_hits(&mut hits, top_k);
        Ok(hits)
    }

    async fn delete(&self, book_id: &str) -> Result<usize> {
        let removed = self.rewrite(book_id, |stored| {
            let n = stored.len();
            stored.clear();
            n
        });
        self.release_writer(book_id);
        Ok(removed)
    }

    async fn indexed_chunks(&self, book_id: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .snapshot(book_id)
            .map(|p| {
                p.iter()
                    .map(|e| (e.chunk_id.clone(), e.content_hash.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove(&self, book_id: &str, chunk_ids: &[String]) -> Result<usize> {
        let doomed: HashSet<&str> = chunk_ids.iter().map(String::as_str).collect();
        Ok(self.rewrite(book_id, |stored| {
            let before = stored.len();
            stored.retain(|e| !doomed.contains(e.chunk_id.as_str()));
            before - stored.len()
        }))
    }

    async fn stats(&self) -> Result<IndexStats> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        Ok(IndexStats {
            model: self.model.name.clone(),
            dims: self.model.dims,
            books: partitions.len(),
            chunks: partitions.values().map(|p| p.len()).sum(),
        })
    }
}

#[derive(Default)]
struct StoreState {
    books: HashMap<String, Book>,
    chunks: HashMap<String, Vec<Chunk>>,
    statuses: HashMap<String, IngestStatus>,
    profiles: HashMap<String, Vec<PersonalityProfile>>,
}

/// In-memory book store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookStore for InMemoryStore {
    async fn upsert_book(&self, book: &Book) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.books.insert(book.id.clone(), book.clone());
        Ok(())
    }

    async fn get_book(&self, id: &str) -> Result<Option<Book>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.books.get(id).cloned())
    }

    async fn delete_book(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.chunks.remove(id);
        state.statuses.remove(id);
        state.profiles.remove(id);
        Ok(state.books.remove(id).is_some())
    }

    async fn replace_chunks(&self, book_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut sorted = chunks.to_vec();
        sorted.sort_by_key(|c| c.position);
        state.chunks.insert(book_id.to_string(), sorted);
        Ok(())
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let by_id: HashMap<&str, &Chunk> = state
            .chunks
            .values()
            .flat_map(|cs| cs.iter())
            .map(|c| (c.id.as_str(), c))
            .collect();
        Ok(ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|c| (*c).clone()))
            .collect())
    }

    async fn chunks_for_book(&self, book_id: &str) -> Result<Vec<Chunk>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.chunks.get(book_id).cloned().unwrap_or_default())
    }

    async fn set_status(&self, book_id: &str, status: &IngestStatus) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.statuses.insert(book_id.to_string(), status.clone());
        Ok(())
    }

    async fn get_status(&self, book_id: &str) -> Result<Option<IngestStatus>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.statuses.get(book_id).cloned())
    }

    async fn save_profiles(&self, book_id: &str, profiles: &[PersonalityProfile]) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .profiles
            .insert(book_id.to_string(), profiles.to_vec());
        Ok(())
    }

    async fn get_profiles(&self, book_id: &str) -> Result<Vec<PersonalityProfile>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.profiles.get(book_id).cloned().unwrap_or_default())
    }
}
