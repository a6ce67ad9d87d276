//! Durable flat vector index.
//!
//! Vectors live in their own SQLite file (`vectors` table, ordinal as an
//! `AUTOINCREMENT` primary key so ordinals are never reused). On open the
//! table is loaded into an in-memory mirror which serves brute-force cosine
//! search; every insert/remove writes the file first and the mirror second.
//!
//! The mirror is guarded by a `std::sync::RwLock` that is never held across
//! an `.await`, so queries only contend with the brief mirror update of a
//! concurrent commit.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use localrag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use localrag_core::store::{top_k_with_ties, VectorEntry, VectorHit, VectorIndex};

use crate::config::Config;
use crate::{db, migrate};

struct Slot {
    chunk_id: String,
    vector: Vec<f32>,
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    mirror: RwLock<BTreeMap<i64, Slot>>,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("vector index mirror lock poisoned")
}

impl SqliteVectorIndex {
    /// Load every stored vector from `pool` into memory.
    pub async fn load(pool: SqlitePool) -> Result<Self> {
        let rows = sqlx::query("SELECT ordinal, chunk_id, embedding FROM vectors ORDER BY ordinal")
            .fetch_all(&pool)
            .await?;

        let mut mirror = BTreeMap::new();
        for row in &rows {
            let ordinal: i64 = row.try_get("ordinal")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            mirror.insert(
                ordinal,
                Slot {
                    chunk_id: row.try_get("chunk_id")?,
                    vector: blob_to_vec(&blob),
                },
            );
        }

        Ok(Self {
            pool,
            mirror: RwLock::new(mirror),
        })
    }

    /// Connect to the configured vector file, apply the schema and load it.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect_vectors(config).await?;
        migrate::migrate_vectors(&pool).await?;
        Self::load(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn insert(&self, chunk_id: &str, model: &str, vector: &[f32]) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO vectors (chunk_id, model, dims, embedding, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chunk_id)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        let ordinal = result.last_insert_rowid();

        let mut mirror = self.mirror.write().map_err(poisoned)?;
        mirror.insert(
            ordinal,
            Slot {
                chunk_id: chunk_id.to_string(),
                vector: vector.to_vec(),
            },
        );
        Ok(ordinal)
    }

    async fn remove(&self, ordinals: &[i64]) -> Result<usize> {
        if ordinals.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut removed = 0usize;
        for ordinal in ordinals {
            let result = sqlx::query("DELETE FROM vectors WHERE ordinal = ?")
                .bind(ordinal)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;

        let mut mirror = self.mirror.write().map_err(poisoned)?;
        for ordinal in ordinals {
            mirror.remove(ordinal);
        }
        Ok(removed)
    }

    async fn entries(&self) -> Result<Vec<VectorEntry>> {
        let mirror = self.mirror.read().map_err(poisoned)?;
        Ok(mirror
            .iter()
            .map(|(ordinal, slot)| VectorEntry {
                ordinal: *ordinal,
                chunk_id: slot.chunk_id.clone(),
            })
            .collect())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        allowed: &HashSet<i64>,
    ) -> Result<Vec<VectorHit>> {
        let mirror = self.mirror.read().map_err(poisoned)?;
        let hits: Vec<VectorHit> = allowed
            .iter()
            .filter_map(|ordinal| {
                mirror.get(ordinal).map(|slot| VectorHit {
                    ordinal: *ordinal,
                    score: cosine_similarity(query, &slot.vector),
                })
            })
            .collect();
        Ok(top_k_with_ties(hits, k))
    }

    async fn len(&self) -> Result<usize> {
        let mirror = self.mirror.read().map_err(poisoned)?;
        Ok(mirror.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> SqliteVectorIndex {
        let pool = db::connect_path(&dir.path().join("vectors.sqlite"))
            .await
            .unwrap();
        migrate::migrate_vectors(&pool).await.unwrap();
        SqliteVectorIndex::load(pool).await.unwrap()
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir).await;
        let a = index.insert("c1", "m", &[1.0, 0.0]).await.unwrap();
        let b = index.insert("c2", "m", &[0.0, 1.0]).await.unwrap();
        assert_eq!(index.remove(&[a, 999]).await.unwrap(), 1);
        index.close().await;

        let index = open(&dir).await;
        let entries = index.entries().await.unwrap();
        assert_eq!(
            entries,
            vec![VectorEntry {
                ordinal: b,
                chunk_id: "c2".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn ordinals_are_not_reused_across_reopen() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir).await;
        let a = index.insert("c1", "m", &[1.0]).await.unwrap();
        index.remove(&[a]).await.unwrap();
        index.close().await;

        let index = open(&dir).await;
        let b = index.insert("c2", "m", &[1.0]).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn search_restricted_to_allowed() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir).await;
        let a = index.insert("c1", "m", &[1.0, 0.0]).await.unwrap();
        let b = index.insert("c2", "m", &[0.7, 0.7]).await.unwrap();
        let c = index.insert("c3", "m", &[0.0, 1.0]).await.unwrap();

        let allowed: HashSet<i64> = [b, c].into_iter().collect();
        let hits = index.search(&[1.0, 0.0], 1, &allowed).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ordinal, b);
        assert_ne!(hits[0].ordinal, a);
    }
}
