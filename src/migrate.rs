use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema in the configured database. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema on an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Books
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS books (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            body TEXT NOT NULL,
            visibility TEXT NOT NULL DEFAULT 'private',
            owner_id TEXT,
            chunk_ids_json TEXT NOT NULL DEFAULT '[]',
            character_ids_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            book_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            text TEXT NOT NULL,
            char_len INTEGER NOT NULL,
            token_estimate INTEGER NOT NULL,
            hash TEXT NOT NULL,
            UNIQUE(book_id, position),
            FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vectors, one row per chunk and embedding model
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT NOT NULL,
            model TEXT NOT NULL,
            book_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            hash TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (chunk_id, model)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Personality profiles
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            book_id TEXT NOT NULL,
            target_key TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            profile_json TEXT NOT NULL,
            PRIMARY KEY (book_id, target_key),
            FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Ingestion status
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_status (
            book_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_book_id ON chunks(book_id, position)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_model_book ON chunk_vectors(model, book_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
