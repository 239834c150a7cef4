//! SQLite-backed [`VectorIndex`] and [`BookStore`] implementations.
//!
//! Vectors live in `chunk_vectors`, keyed by `(chunk_id, model)`, so rows
//! written by another embedding model are never read by the active index.
//! Search loads the candidate blobs for the selected books and ranks them
//! by cosine similarity in Rust.
//!
//! Every multi-row write runs in one transaction: readers see a book's
//! vectors either before or after a batch, never half of it.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use folio_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use folio_core::models::{Book, Chunk, EmbeddingModel, IngestStatus, PersonalityProfile, Visibility};
use folio_core::store::{
    check_dims, rank_hits, BookStore, IndexEntry, IndexHit, IndexStats, VectorIndex,
};
use folio_core::{Error, Result};

fn storage(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Vector index over the `chunk_vectors` table, bound to one model.
pub struct SqliteIndex {
    pool: SqlitePool,
    model: EmbeddingModel,
}

impl SqliteIndex {
    /// Bind an index to `model`.
    ///
    /// Fails with [`Error::DimensionMismatch`] if rows already stored for
    /// this model name have a different dimensionality.
    pub async fn open(pool: SqlitePool, model: EmbeddingModel) -> Result<Self> {
        let stored: Vec<i64> =
            sqlx::query_scalar("SELECT DISTINCT dims FROM chunk_vectors WHERE model = ?")
                .bind(&model.name)
                .fetch_all(&pool)
                .await
                .map_err(storage)?;

        if let Some(bad) = stored.iter().find(|d| **d as usize != model.dims) {
            return Err(Error::DimensionMismatch {
                context: format!("stored vectors for model {}", model.name),
                expected: model.dims,
                actual: *bad as usize,
            });
        }

        let blob_lengths: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT length(embedding) FROM chunk_vectors WHERE model = ?",
        )
        .bind(&model.name)
        .fetch_all(&pool)
        .await
        .map_err(storage)?;

        if let Some(bad) = blob_lengths
            .iter()
            .find(|len| **len as usize != model.dims * 4)
        {
            return Err(Error::DimensionMismatch {
                context: format!("stored vector blobs for model {}", model.name),
                expected: model.dims,
                actual: *bad as usize / 4,
            });
        }

        Ok(Self { pool, model })
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn model(&self) -> EmbeddingModel {
        self.model.clone()
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        for entry in entries {
            check_dims(&self.model, &entry.vector, &entry.chunk_id)?;
        }
        if entries.is_empty() {
            return Ok(());
        }

        let ts = now();
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, model, book_id, position, hash, dims, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id, model) DO UPDATE SET
                    book_id = excluded.book_id,
                    position = excluded.position,
                    hash = excluded.hash,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&entry.chunk_id)
            .bind(&self.model.name)
            .bind(&entry.book_id)
            .bind(entry.position)
            .bind(&entry.content_hash)
            .bind(self.model.dims as i64)
            .bind(vec_to_blob(&entry.vector))
            .bind(ts)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
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

        let sql = format!(
            "SELECT chunk_id, book_id, position, hash, embedding FROM chunk_vectors \
             WHERE model = ? AND book_id IN ({})",
            placeholders(book_ids.len())
        );
        let mut q = sqlx::query(&sql).bind(&self.model.name);
        for id in book_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| Error::IndexUnavailable {
            book_id: book_ids.iter().cloned().collect::<Vec<_>>().join(","),
            reason: e.to_string(),
        })?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            let chunk_id: String = row.get("chunk_id");
            check_dims(&self.model, &vector, &chunk_id)?;
            hits.push(IndexHit {
                chunk_id,
                book_id: row.get("book_id"),
                position: row.get("position"),
                content_hash: row.get("hash"),
                score: cosine_similarity(query, &vector) as f64,
            });
        }

        rank_hits(&mut hits, top_k);
        Ok(hits)
    }

    async fn delete(&self, book_id: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM chunk_vectors WHERE book_id = ?")
            .bind(book_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() as usize)
    }

    async fn indexed_chunks(&self, book_id: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT chunk_id, hash FROM chunk_vectors WHERE model = ? AND book_id = ?")
            .bind(&self.model.name)
            .bind(book_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows
            .iter()
            .map(|row| (row.get("chunk_id"), row.get("hash")))
            .collect())
    }

    async fn remove(&self, book_id: &str, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut removed = 0;
        for id in chunk_ids {
            let result =
                sqlx::query("DELETE FROM chunk_vectors WHERE model = ? AND book_id = ? AND chunk_id = ?")
                    .bind(&self.model.name)
                    .bind(book_id)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage)?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(storage)?;
        Ok(removed)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT book_id) AS books, COUNT(*) AS chunks FROM chunk_vectors WHERE model = ?",
        )
        .bind(&self.model.name)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        let books: i64 = row.get("books");
        let chunks: i64 = row.get("chunks");
        Ok(IndexStats {
            model: self.model.name.clone(),
            dims: self.model.dims,
            books: books as usize,
            chunks: chunks as usize,
        })
    }
}

/// Book records, chunks, statuses, and profiles in SQLite.
pub struct SqliteBookStore {
    pool: SqlitePool,
}

impl SqliteBookStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    let start: i64 = row.get("start_offset");
    let end: i64 = row.get("end_offset");
    let char_len: i64 = row.get("char_len");
    let token_estimate: i64 = row.get("token_estimate");
    Chunk {
        id: row.get("id"),
        book_id: row.get("book_id"),
        position: row.get("position"),
        start: start as usize,
        end: end as usize,
        text: row.get("text"),
        char_len: char_len as usize,
        token_estimate: token_estimate as usize,
        hash: row.get("hash"),
    }
}

const CHUNK_COLUMNS: &str =
    "id, book_id, position, start_offset, end_offset, text, char_len, token_estimate, hash";

#[async_trait]
impl BookStore for SqliteBookStore {
    async fn upsert_book(&self, book: &Book) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO books (id, title, author, body, visibility, owner_id,
                               chunk_ids_json, character_ids_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                author = excluded.author,
                body = excluded.body,
                visibility = excluded.visibility,
                owner_id = excluded.owner_id,
                chunk_ids_json = excluded.chunk_ids_json,
                character_ids_json = excluded.character_ids_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&book.id)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.text)
        .bind(book.visibility.as_str())
        .bind(&book.owner_id)
        .bind(serde_json::to_string(&book.chunk_ids)?)
        .bind(serde_json::to_string(&book.character_ids)?)
        .bind(book.created_at)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_book(&self, id: &str) -> Result<Option<Book>> {
        let row = sqlx::query(
            "SELECT id, title, author, body, visibility, owner_id, chunk_ids_json, \
             character_ids_json, created_at FROM books WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let visibility: String = row.get("visibility");
        let chunk_ids: String = row.get("chunk_ids_json");
        let character_ids: String = row.get("character_ids_json");
        Ok(Some(Book {
            id: row.get("id"),
            title: row.get("title"),
            author: row.get("author"),
            text: row.get("body"),
            visibility: Visibility::parse(&visibility),
            owner_id: row.get("owner_id"),
            chunk_ids: serde_json::from_str(&chunk_ids)?,
            character_ids: serde_json::from_str(&character_ids)?,
            created_at: row.get("created_at"),
        }))
    }

    async fn delete_book(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for table in ["chunks", "profiles", "ingest_status"] {
            let sql = format!("DELETE FROM {} WHERE book_id = ?", table);
            sqlx::query(&sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }
        let result = sqlx::query("DELETE FROM books WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_chunks(&self, book_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("DELETE FROM chunks WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, book_id, position, start_offset, end_offset, text,
                                    char_len, token_estimate, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(book_id)
            .bind(chunk.position)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(&chunk.text)
            .bind(chunk.char_len as i64)
            .bind(chunk.token_estimate as i64)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM chunks WHERE id IN ({})",
            CHUNK_COLUMNS,
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(storage)?;
        let mut by_id: HashMap<String, Chunk> = rows
            .iter()
            .map(row_to_chunk)
            .map(|c| (c.id.clone(), c))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn chunks_for_book(&self, book_id: &str) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE book_id = ? ORDER BY position",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(book_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn set_status(&self, book_id: &str, status: &IngestStatus) -> Result<()> {
        let (kind, message) = match status {
            IngestStatus::Failed { kind, message } => (Some(kind.as_str()), Some(message.as_str())),
            _ => (None, None),
        };
        sqlx::query(
            r#"
            INSERT INTO ingest_status (book_id, state, error_kind, error_message, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(book_id) DO UPDATE SET
                state = excluded.state,
                error_kind = excluded.error_kind,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(book_id)
        .bind(status.as_str())
        .bind(kind)
        .bind(message)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get_status(&self, book_id: &str) -> Result<Option<IngestStatus>> {
        let row = sqlx::query(
            "SELECT state, error_kind, error_message FROM ingest_status WHERE book_id = ?",
        )
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(|r| {
            let state: String = r.get("state");
            IngestStatus::from_parts(&state, r.get("error_kind"), r.get("error_message"))
        }))
    }

    async fn save_profiles(&self, book_id: &str, profiles: &[PersonalityProfile]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("DELETE FROM profiles WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        for (ordinal, profile) in profiles.iter().enumerate() {
            let key = profile
                .target
                .character_id()
                .unwrap_or_else(|| "book".to_string());
            sqlx::query(
                "INSERT INTO profiles (book_id, target_key, ordinal, profile_json) VALUES (?, ?, ?, ?)",
            )
            .bind(book_id)
            .bind(key)
            .bind(ordinal as i64)
            .bind(serde_json::to_string(profile)?)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn get_profiles(&self, book_id: &str) -> Result<Vec<PersonalityProfile>> {
        let rows = sqlx::query("SELECT profile_json FROM profiles WHERE book_id = ? ORDER BY ordinal")
            .bind(book_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        let mut profiles = Vec::with_capacity(rows.len());
        for row in &rows {
            let json: String = row.get("profile_json");
            profiles.push(serde_json::from_str(&json)?);
        }
        Ok(profiles)
    }
}
