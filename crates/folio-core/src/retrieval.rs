//! Retrieval orchestrator: query + selected books → ranked evidence.
//!
//! # Algorithm
//!
//! 1. Contextualize the query with the last `history_window` user turns.
//! 2. Check the embedder and the index share one [`EmbeddingModel`].
//! 3. Embed the contextualized query.
//! 4. Search every selected book concurrently for
//!    `top_k × candidate_multiplier` candidates, retrying a failing book up
//!    to `max_attempts` times. A book that still fails becomes a
//!    [`Warning::BookUnavailable`]; if every book fails, retrieval fails.
//! 5. Merge all candidates and re-rank globally by score (ties: position,
//!    book id, chunk id).
//! 6. Drop candidates below `min_similarity`.
//! 7. Deduplicate: a candidate adjacent (|Δposition| ≤ 1) to a better one
//!    from the same book, or with identical content, is dropped.
//! 8. Keep `top_k`, attach chunk text, and number ranks from 1.
//!
//! An empty result is not an error: the generation stage refuses on it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::models::{Chunk, ConversationTurn, EvidenceItem, Role};
use crate::store::{check_dims, compare_hits, BookStore, IndexHit, VectorIndex};

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    pub top_k: usize,
    /// Candidates below this cosine similarity are discarded.
    pub min_similarity: f64,
    /// Per-book candidate count is `top_k × candidate_multiplier`.
    pub candidate_multiplier: usize,
    /// Prior user turns folded into the query embedding.
    pub history_window: usize,
    /// Attempts per book before it is reported unavailable.
    pub max_attempts: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.30,
            candidate_multiplier: 3,
            history_window: 2,
            max_attempts: 2,
        }
    }
}

/// A non-fatal problem surfaced alongside a chat response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// A selected book could not be searched; results exclude it.
    BookUnavailable { book_id: String, reason: String },
    /// Retrieval exceeded its deadline; the turn continued with no evidence.
    RetrievalTimedOut { after_ms: u64 },
    /// A selected book has no personality profile yet.
    ProfileMissing { book_id: String },
    /// The requested character has no profile in the selected books.
    CharacterUnavailable { character_id: String },
}

/// Retrieval output.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Retrieval {
    pub evidence: Vec<EvidenceItem>,
    pub warnings: Vec<Warning>,
}

/// Book-scoped retriever over an injected embedder, index, and store.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn BookStore>,
    params: RetrievalParams,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn BookStore>,
        params: RetrievalParams,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            params,
        }
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Retrieve up to `top_k` evidence items for `query` from `book_ids`.
    ///
    /// # Errors
    ///
    /// - [`Error::ModelMismatch`] if the embedder and index models differ.
    /// - [`Error::IndexUnavailable`] if no selected book could be searched.
    /// - Embedding failures from the provider.
    pub async fn retrieve(
        &self,
        query: &str,
        book_ids: &[String],
        top_k: usize,
        history: &[ConversationTurn],
    ) -> Result<Retrieval> {
        let books: Vec<String> = {
            let mut seen = HashSet::new();
            book_ids
                .iter()
                .filter(|id| seen.insert(id.as_str()))
                .cloned()
                .collect()
        };
        if books.is_empty() || top_k == 0 || query.trim().is_empty() {
            return Ok(Retrieval::default());
        }

        let index_model = self.index.model();
        let query_model = self.embedder.model();
        if index_model != query_model {
            return Err(Error::ModelMismatch {
                index: format!("{}/{}", index_model.name, index_model.dims),
                query: format!("{}/{}", query_model.name, query_model.dims),
            });
        }

        let text = contextualize_query(query, history, self.params.history_window);
        let query_vec = embed_one(self.embedder.as_ref(), &text).await?;
        check_dims(&index_model, &query_vec, "query embedding")?;

        let per_book = top_k * self.params.candidate_multiplier.max(1);
        let searches = books
            .iter()
            .map(|book_id| self.search_book(book_id, &query_vec, per_book));
        let outcomes = join_all(searches).await;

        let mut warnings = Vec::new();
        let mut candidates: Vec<IndexHit> = Vec::new();
        let mut last_failure = None;
        for (book_id, outcome) in books.iter().zip(outcomes) {
            match outcome {
                Ok(hits) => candidates.extend(hits),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(book_id = %book_id, error = %e, "book excluded from retrieval");
                    warnings.push(Warning::BookUnavailable {
                        book_id: book_id.clone(),
                        reason: e.to_string(),
                    });
                    last_failure = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if warnings.len() == books.len() {
            let reason = last_failure
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no book could be searched".to_string());
            return Err(Error::IndexUnavailable {
                book_id: books.join(","),
                reason,
            });
        }

        let kept = select_candidates(candidates, self.params.min_similarity, top_k);
        let evidence = self.attach_text(kept).await?;

        tracing::debug!(
            books = books.len(),
            evidence = evidence.len(),
            warnings = warnings.len(),
            "retrieval complete"
        );

        Ok(Retrieval { evidence, warnings })
    }

    async fn search_book(
        &self,
        book_id: &str,
        query_vec: &[f32],
        limit: usize,
    ) -> Result<Vec<IndexHit>> {
        let scope: BTreeSet<String> = std::iter::once(book_id.to_string()).collect();
        let attempts = self.params.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.index.search(query_vec, &scope, limit).await {
                Ok(hits) => return Ok(hits),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::debug!(book_id, attempt, error = %e, "retrying book search");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attach_text(&self, hits: Vec<IndexHit>) -> Result<Vec<EvidenceItem>> {
        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let chunks = self.store.get_chunks(&ids).await?;
        let mut chunk_by_id: HashMap<String, Chunk> =
            chunks.into_iter().map(|c| (c.id.clone(), c)).collect();

        let mut evidence = Vec::with_capacity(hits.len());
        for hit in hits {
            // A chunk deleted after the search is not evidence.
            let Some(chunk) = chunk_by_id.remove(&hit.chunk_id) else {
                continue;
            };
            // The vector was scored against other text than what is stored now.
            if chunk.hash != hit.content_hash {
                tracing::debug!(chunk_id = %hit.chunk_id, "skipping hit with outdated vector");
                continue;
            }
            let text = chunk.text;
            evidence.push(EvidenceItem {
                chunk_id: hit.chunk_id,
                book_id: hit.book_id,
                position: hit.position,
                score: hit.score,
                rank: evidence.len() + 1,
                text,
            });
        }
        Ok(evidence)
    }
}

/// Fold the last `window` user turns into the query text, oldest first.
pub fn contextualize_query(query: &str, history: &[ConversationTurn], window: usize) -> String {
    let mut prior: Vec<&str> = history
        .iter()
        .rev()
        .filter(|t| t.role == Role::User)
        .take(window)
        .map(|t| t.text.as_str())
        .collect();
    prior.reverse();
    prior.push(query);
    prior.join("\n")
}

/// Global re-rank, similarity floor, dedup, and truncation.
pub fn select_candidates(mut hits: Vec<IndexHit>, min_similarity: f64, top_k: usize) -> Vec<IndexHit> {
    hits.retain(|h| h.score.is_finite() && h.score >= min_similarity);
    hits.sort_by(compare_hits);

    let mut kept: Vec<IndexHit> = Vec::new();
    let mut hashes: HashSet<String> = HashSet::new();
    for hit in hits {
        if kept.len() >= top_k {
            break;
        }
        if hashes.contains(&hit.content_hash) {
            continue;
        }
        let adjacent = kept
            .iter()
            .any(|k| k.book_id == hit.book_id && (k.position - hit.position).abs() <= 1);
        if adjacent {
            continue;
        }
        hashes.insert(hit.content_hash.clone());
        kept.push(hit);
    }
    kept
}
