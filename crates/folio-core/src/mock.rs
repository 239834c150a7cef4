//! Deterministic provider and index doubles for tests.
//!
//! ```rust
//! use folio_core::embedding::EmbeddingProvider;
//! use folio_core::mock::MockEmbedder;
//!
//! # futures::executor::block_on(async {
//! let embedder = MockEmbedder::new().with_dims(64);
//! let v = embedder.embed_texts(&["Call me Ishmael".to_string()]).await.unwrap();
//! assert_eq!(v[0].len(), 64);
//! # });
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::embedding::{EmbeddingProvider, GenerationProvider};
use crate::error::{Error, Result};
use crate::generation::content_words;
use crate::models::EmbeddingModel;
use crate::store::{IndexEntry, IndexHit, IndexStats, VectorIndex};

/// Bag-of-words embedder: each content word hashes to one dimension.
///
/// Texts sharing content words have positive cosine similarity; texts with
/// none in common are orthogonal.
#[derive(Debug)]
pub struct MockEmbedder {
    model: EmbeddingModel,
    texts_embedded: AtomicUsize,
    fail: bool,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            model: EmbeddingModel::new("mock-bow", 256),
            texts_embedded: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn with_dims(mut self, dims: usize) -> Self {
        self.model.dims = dims;
        self
    }

    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model.name = name.into();
        self
    }

    /// Every call fails with `ProviderUnavailable`.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Total number of texts embedded so far.
    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    /// Embed synchronously.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.model.dims.max(1)];
        for word in content_words(text) {
            let slot = (fnv1a(word.as_bytes()) % v.len() as u64) as usize;
            v[slot] += 1.0;
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn model(&self) -> EmbeddingModel {
        self.model.clone()
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail {
            return Err(Error::ProviderUnavailable("mock embedder offline".into()));
        }
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Scripted generator.
///
/// Prompts containing a rule's needle get that rule's reply. Otherwise
/// scripted replies are returned in order, the last one repeating.
#[derive(Debug, Default)]
pub struct MockGenerator {
    rules: Vec<(String, String)>,
    replies: Vec<String>,
    failure: Option<String>,
    calls: AtomicUsize,
    scripted: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockGenerator {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies,
            ..Self::default()
        }
    }

    /// Every call fails with `ProviderUnavailable(message)`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Reply with `reply` whenever the prompt contains `needle`.
    pub fn with_rule(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push((needle.into(), reply.into()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl GenerationProvider for MockGenerator {
    fn model_name(&self) -> &str {
        "mock-generator"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        if let Some(message) = &self.failure {
            return Err(Error::ProviderUnavailable(message.clone()));
        }
        if let Some((_, reply)) = self.rules.iter().find(|(needle, _)| prompt.contains(needle)) {
            return Ok(reply.clone());
        }
        let n = self.scripted.fetch_add(1, Ordering::SeqCst);
        self.replies
            .get(n)
            .or_else(|| self.replies.last())
            .cloned()
            .ok_or_else(|| Error::ProviderUnavailable("no scripted reply".into()))
    }
}

/// Wraps an index and fails searches for chosen books.
pub struct FlakyIndex {
    inner: Arc<dyn VectorIndex>,
    failures: Mutex<HashMap<String, usize>>,
    searches: Mutex<HashMap<String, usize>>,
}

impl FlakyIndex {
    pub fn new(inner: Arc<dyn VectorIndex>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            searches: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` searches touching `book_id`.
    pub fn fail_book(&self, book_id: &str, times: usize) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(book_id.to_string(), times);
    }

    /// Searches attempted for a book, including failed ones.
    pub fn searches(&self, book_id: &str) -> usize {
        self.searches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(book_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    fn model(&self) -> EmbeddingModel {
        self.inner.model()
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        self.inner.upsert(entries).await
    }

    async fn search(
        &self,
        query: &[f32],
        book_ids: &BTreeSet<String>,
        top_k: usize,
    ) -> Result<Vec<IndexHit>> {
        {
            let mut searches = self.searches.lock().unwrap_or_else(|e| e.into_inner());
            for id in book_ids {
                *searches.entry(id.clone()).or_insert(0) += 1;
            }
        }
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            for id in book_ids {
                if let Some(left) = failures.get_mut(id) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(Error::IndexUnavailable {
                            book_id: id.clone(),
                            reason: "injected failure".into(),
                        });
                    }
                }
            }
        }
        self.inner.search(query, book_ids, top_k).await
    }

    async fn delete(&self, book_id: &str) -> Result<usize> {
        self.inner.delete(book_id).await
    }

    async fn indexed_chunks(&self, book_id: &str) -> Result<HashMap<String, String>> {
        self.inner.indexed_chunks(book_id).await
    }

    async fn remove(&self, book_id: &str, chunk_ids: &[String]) -> Result<usize> {
        self.inner.remove(book_id, chunk_ids).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        self.inner.stats().await
    }
}
