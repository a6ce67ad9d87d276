//! Schema for the two stores.
//!
//! The metadata store and the vector index live in separate SQLite files so
//! that neither can be committed as a side effect of the other; the catalog
//! protocol is what keeps them consistent.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_metadata(&pool).await?;
    pool.close().await;

    let pool = db::connect_vectors(config).await?;
    migrate_vectors(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_metadata(pool: &SqlitePool) -> Result<()> {
    // Documents, keyed by canonical path
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            path TEXT PRIMARY KEY,
            title TEXT,
            content_hash TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            format TEXT NOT NULL,
            scan_mode TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunk rows with their commit state
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            length INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            status TEXT NOT NULL,
            ordinal INTEGER,
            model TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Content-hash embedding cache; retired rows are kept as tombstones
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            text_hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            retired_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(status, created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)")
        .execute(pool)
        .await?;
    // At most one current embedding per (text, model)
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_embedding_cache_current \
         ON embedding_cache(text_hash, model) WHERE retired_at IS NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn migrate_vectors(pool: &SqlitePool) -> Result<()> {
    // AUTOINCREMENT keeps ordinals from ever being reused
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            ordinal INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
