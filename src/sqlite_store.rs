//! SQLite-backed [`MetadataStore`].
//!
//! Documents are keyed by canonical path. Chunk rows carry their commit
//! status and vector ordinal. The embedding cache keeps retired rows as
//! tombstones (`retired_at` set); a partial unique index allows at most one
//! current row per `(text_hash, model)`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

use localrag_core::embedding::{blob_to_vec, vec_to_blob};
use localrag_core::models::{
    Chunk, ChunkRecord, ChunkStatus, Document, DocumentStatus, RetrievalFilter, ScanMode,
};
use localrag_core::store::{CommittedEntry, MetadataStore, StoreCounts};

use crate::config::Config;
use crate::{db, migrate};

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured metadata database and apply the schema.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_metadata(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Committed chunks passing `filter`; with `indexed_only`, only those
    /// whose document row is in status `indexed`.
    async fn entries_matching(
        &self,
        filter: &RetrievalFilter,
        indexed_only: bool,
    ) -> Result<Vec<CommittedEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT c.ordinal AS ordinal, c.id AS chunk_id, c.document_id AS document_id,
                   COALESCE(d.modified_at, 0) AS modified_at
            FROM chunks c
            LEFT JOIN documents d ON d.path = c.document_id
            WHERE c.status = 'committed' AND c.ordinal IS NOT NULL
              AND COALESCE(d.modified_at, 0) >= ?
              AND (? = 0 OR d.status = 'indexed')
            ORDER BY c.ordinal ASC
            "#,
        )
        .bind(filter.modified_since.unwrap_or(i64::MIN))
        .bind(indexed_only)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let document_id: String = row.try_get("document_id")?;
            let path = PathBuf::from(&document_id);
            let modified_at: i64 = row.try_get("modified_at")?;
            // Component-wise prefix match; SQL LIKE would treat /home as a prefix of /homework.
            if !filter.matches(&path, modified_at) {
                continue;
            }
            entries.push(CommittedEntry {
                ordinal: row.try_get("ordinal")?,
                chunk_id: row.try_get("chunk_id")?,
                document_id,
                path,
                modified_at,
            });
        }
        Ok(entries)
    }
}

const DOCUMENT_COLUMNS: &str =
    "path, title, content_hash, size_bytes, modified_at, format, scan_mode, status, error, updated_at";

const CHUNK_COLUMNS: &str =
    "id, document_id, seq, start_offset, end_offset, length, text, hash, status, ordinal, model, created_at";

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let path: String = row.try_get("path")?;
    let scan_mode: String = row.try_get("scan_mode")?;
    let status: String = row.try_get("status")?;
    let size_bytes: i64 = row.try_get("size_bytes")?;
    Ok(Document {
        path: PathBuf::from(path),
        title: row.try_get("title")?,
        content_hash: row.try_get("content_hash")?,
        size_bytes: size_bytes.max(0) as u64,
        modified_at: row.try_get("modified_at")?,
        format: row.try_get("format")?,
        scan_mode: scan_mode.parse::<ScanMode>().map_err(anyhow::Error::msg)?,
        status: status.parse::<DocumentStatus>().map_err(anyhow::Error::msg)?,
        error: row.try_get("error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_chunk_record(row: &SqliteRow) -> Result<ChunkRecord> {
    let seq: i64 = row.try_get("seq")?;
    let start: i64 = row.try_get("start_offset")?;
    let end: i64 = row.try_get("end_offset")?;
    let length: i64 = row.try_get("length")?;
    let status: String = row.try_get("status")?;
    Ok(ChunkRecord {
        chunk: Chunk {
            id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            seq: seq as u32,
            start: start as usize,
            end: end as usize,
            length: length as usize,
            text: row.try_get("text")?,
            hash: row.try_get("hash")?,
        },
        status: status.parse::<ChunkStatus>().map_err(anyhow::Error::msg)?,
        ordinal: row.try_get("ordinal")?,
        model: row.try_get("model")?,
        created_at: row.try_get("created_at")?,
    })
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_document(&self, path: &Path) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE path = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(path_key(path))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn put_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (path, title, content_hash, size_bytes, modified_at, format,
                                   scan_mode, status, error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                title = excluded.title,
                content_hash = excluded.content_hash,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                format = excluded.format,
                scan_mode = excluded.scan_mode,
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(path_key(&doc.path))
        .bind(&doc.title)
        .bind(&doc.content_hash)
        .bind(doc.size_bytes as i64)
        .bind(doc.modified_at)
        .bind(&doc.format)
        .bind(doc.scan_mode.as_str())
        .bind(doc.status.as_str())
        .bind(&doc.error)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "SELECT {} FROM documents WHERE status = ? ORDER BY path ASC",
                    DOCUMENT_COLUMNS
                ))
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM documents ORDER BY path ASC",
                    DOCUMENT_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_document).collect()
    }

    async fn insert_pending_chunk(&self, chunk: &Chunk, model: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, seq, start_offset, end_offset, length, text, hash,
                                status, ordinal, model, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                document_id = excluded.document_id,
                seq = excluded.seq,
                start_offset = excluded.start_offset,
                end_offset = excluded.end_offset,
                length = excluded.length,
                text = excluded.text,
                hash = excluded.hash,
                status = 'pending',
                ordinal = NULL,
                model = excluded.model,
                created_at = excluded.created_at
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.seq as i64)
        .bind(chunk.start as i64)
        .bind(chunk.end as i64)
        .bind(chunk.length as i64)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(model)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_committed(&self, chunk_id: &str, ordinal: i64) -> Result<()> {
        let result = sqlx::query("UPDATE chunks SET status = 'committed', ordinal = ? WHERE id = ?")
            .bind(ordinal)
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            bail!("no chunk row {}", chunk_id);
        }
        Ok(())
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM chunks WHERE id = ?", CHUNK_COLUMNS))
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_chunk_record).transpose()
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE document_id = ? ORDER BY seq ASC",
            CHUNK_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk_record).collect()
    }

    async fn delete_document_chunks(&self, document_id: &str) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;

        let ordinals: Vec<i64> = sqlx::query_scalar(
            "SELECT ordinal FROM chunks WHERE document_id = ? AND status = 'committed' \
             AND ordinal IS NOT NULL ORDER BY ordinal ASC",
        )
        .bind(document_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(ordinals)
    }

    async fn purge_pending(&self, older_than: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE status = 'pending' AND created_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn committed_entries(&self, filter: &RetrievalFilter) -> Result<Vec<CommittedEntry>> {
        self.entries_matching(filter, false).await
    }

    async fn retrievable_entries(
        &self,
        filter: &RetrievalFilter,
    ) -> Result<Vec<CommittedEntry>> {
        self.entries_matching(filter, true).await
    }

    async fn cached_embedding(&self, text_hash: &str, model: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT embedding FROM embedding_cache \
             WHERE text_hash = ? AND model = ? AND retired_at IS NULL \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(text_hash)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    async fn cache_embedding(
        &self,
        text_hash: &str,
        model: &str,
        vector: &[f32],
        now: i64,
    ) -> Result<()> {
        // A current row already present wins; tombstones are never overwritten.
        sqlx::query(
            "INSERT OR IGNORE INTO embedding_cache (text_hash, model, dims, embedding, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(text_hash)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retire_embeddings(&self, model: &str, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE embedding_cache SET retired_at = ? WHERE model = ? AND retired_at IS NULL",
        )
        .bind(now)
        .bind(model)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM index_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_state(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(v) => {
                sqlx::query(
                    "INSERT INTO index_state (key, value) VALUES (?, ?) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .bind(key)
                .bind(v)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM index_state WHERE key = ?")
                    .bind(key)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM documents GROUP BY status ORDER BY status ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut documents = Vec::with_capacity(by_status.len());
        for (status, count) in by_status {
            let status = status
                .parse::<DocumentStatus>()
                .map_err(|e| anyhow!("documents table: {}", e))?;
            documents.push((status, count as u64));
        }

        let pending_chunks: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        let committed_chunks: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE status = 'committed'")
                .fetch_one(&self.pool)
                .await?;
        let cached_embeddings: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache WHERE retired_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        let retired_embeddings: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache WHERE retired_at IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreCounts {
            documents,
            pending_chunks: pending_chunks as u64,
            committed_chunks: committed_chunks as u64,
            cached_embeddings: cached_embeddings as u64,
            retired_embeddings: retired_embeddings as u64,
        })
    }
}
