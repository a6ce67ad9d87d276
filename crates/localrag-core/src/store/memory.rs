//! In-memory [`MetadataStore`] and [`VectorIndex`] implementations.
//!
//! Uses `HashMap`/`BTreeMap` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity. Used by tests and embedders of the core
//! that do not need durability.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{
    Chunk, ChunkRecord, ChunkStatus, Document, DocumentStatus, RetrievalFilter,
};

use super::{
    top_k_with_ties, CommittedEntry, MetadataStore, StoreCounts, VectorEntry, VectorHit,
    VectorIndex,
};

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

struct CachedVector {
    vector: Vec<f32>,
    retired: bool,
}

/// In-memory metadata store.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    docs: RwLock<HashMap<PathBuf, Document>>,
    chunks: RwLock<HashMap<String, ChunkRecord>>,
    cache: RwLock<HashMap<(String, String), Vec<CachedVector>>>,
    state: RwLock<HashMap<String, String>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries_matching(
        &self,
        filter: &RetrievalFilter,
        indexed_only: bool,
    ) -> Result<Vec<CommittedEntry>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let chunks = self.chunks.read().map_err(poisoned)?;
        let mut out = Vec::new();
        for record in chunks.values() {
            let ordinal = match (record.status, record.ordinal) {
                (ChunkStatus::Committed, Some(o)) => o,
                _ => continue,
            };
            let path = PathBuf::from(&record.chunk.document_id);
            let doc = docs.get(&path);
            if indexed_only && doc.map(|d| d.status) != Some(DocumentStatus::Indexed) {
                continue;
            }
            let modified_at = doc.map(|d| d.modified_at).unwrap_or(0);
            if !filter.matches(&path, modified_at) {
                continue;
            }
            out.push(CommittedEntry {
                ordinal,
                chunk_id: record.chunk.id.clone(),
                document_id: record.chunk.document_id.clone(),
                path,
                modified_at,
            });
        }
        out.sort_by_key(|e| e.ordinal);
        Ok(out)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get_document(&self, path: &Path) -> Result<Option<Document>> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs.get(path).cloned())
    }

    async fn put_document(&self, doc: &Document) -> Result<()> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        docs.insert(doc.path.clone(), doc.clone());
        Ok(())
    }

    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut out: Vec<Document> = docs
            .values()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn insert_pending_chunk(&self, chunk: &Chunk, model: &str, now: i64) -> Result<()> {
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        chunks.insert(
            chunk.id.clone(),
            ChunkRecord {
                chunk: chunk.clone(),
                status: ChunkStatus::Pending,
                ordinal: None,
                model: model.to_string(),
                created_at: now,
            },
        );
        Ok(())
    }

    async fn mark_committed(&self, chunk_id: &str, ordinal: i64) -> Result<()> {
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        let record = chunks
            .get_mut(chunk_id)
            .ok_or_else(|| anyhow!("no chunk row {}", chunk_id))?;
        record.status = ChunkStatus::Committed;
        record.ordinal = Some(ordinal);
        Ok(())
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        Ok(chunks.get(chunk_id).cloned())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<ChunkRecord>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        let mut out: Vec<ChunkRecord> = chunks
            .values()
            .filter(|r| r.chunk.document_id == document_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.chunk.seq);
        Ok(out)
    }

    async fn delete_document_chunks(&self, document_id: &str) -> Result<Vec<i64>> {
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        let mut ordinals = Vec::new();
        chunks.retain(|_, r| {
            if r.chunk.document_id != document_id {
                return true;
            }
            if r.status == ChunkStatus::Committed {
                ordinals.extend(r.ordinal);
            }
            false
        });
        ordinals.sort_unstable();
        Ok(ordinals)
    }

    async fn purge_pending(&self, older_than: i64) -> Result<u64> {
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        let before = chunks.len();
        chunks.retain(|_, r| !(r.status == ChunkStatus::Pending && r.created_at < older_than));
        Ok((before - chunks.len()) as u64)
    }

    async fn committed_entries(&self, filter: &RetrievalFilter) -> Result<Vec<CommittedEntry>> {
        self.entries_matching(filter, false)
    }

    async fn retrievable_entries(
        &self,
        filter: &RetrievalFilter,
    ) -> Result<Vec<CommittedEntry>> {
        self.entries_matching(filter, true)
    }

    async fn cached_embedding(&self, text_hash: &str, model: &str) -> Result<Option<Vec<f32>>> {
        let cache = self.cache.read().map_err(poisoned)?;
        Ok(cache
            .get(&(text_hash.to_string(), model.to_string()))
            .and_then(|versions| versions.iter().rev().find(|v| !v.retired))
            .map(|v| v.vector.clone()))
    }

    async fn cache_embedding(
        &self,
        text_hash: &str,
        model: &str,
        vector: &[f32],
        _now: i64,
    ) -> Result<()> {
        let mut cache = self.cache.write().map_err(poisoned)?;
        let versions = cache
            .entry((text_hash.to_string(), model.to_string()))
            .or_default();
        if !versions.iter().any(|v| !v.retired) {
            versions.push(CachedVector {
                vector: vector.to_vec(),
                retired: false,
            });
        }
        Ok(())
    }

    async fn retire_embeddings(&self, model: &str, _now: i64) -> Result<u64> {
        let mut cache = self.cache.write().map_err(poisoned)?;
        let mut retired = 0u64;
        for ((_, m), versions) in cache.iter_mut() {
            if m != model {
                continue;
            }
            for v in versions.iter_mut().filter(|v| !v.retired) {
                v.retired = true;
                retired += 1;
            }
        }
        Ok(retired)
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.get(key).cloned())
    }

    async fn set_state(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        match value {
            Some(v) => state.insert(key.to_string(), v.to_string()),
            None => state.remove(key),
        };
        Ok(())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let docs = self.docs.read().map_err(poisoned)?;
        let chunks = self.chunks.read().map_err(poisoned)?;
        let cache = self.cache.read().map_err(poisoned)?;

        let mut by_status: BTreeMap<&'static str, (DocumentStatus, u64)> = BTreeMap::new();
        for d in docs.values() {
            by_status.entry(d.status.as_str()).or_insert((d.status, 0)).1 += 1;
        }

        let versions = cache.values().flatten();
        let (retired, current): (Vec<_>, Vec<_>) = versions.partition(|v| v.retired);

        Ok(StoreCounts {
            documents: by_status.into_values().collect(),
            pending_chunks: chunks
                .values()
                .filter(|r| r.status == ChunkStatus::Pending)
                .count() as u64,
            committed_chunks: chunks
                .values()
                .filter(|r| r.status == ChunkStatus::Committed)
                .count() as u64,
            cached_embeddings: current.len() as u64,
            retired_embeddings: retired.len() as u64,
        })
    }
}

struct StoredVector {
    chunk_id: String,
    vector: Vec<f32>,
}

/// In-memory flat vector index.
pub struct InMemoryVectorIndex {
    entries: RwLock<BTreeMap<i64, StoredVector>>,
    next_ordinal: AtomicI64,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_ordinal: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn insert(&self, chunk_id: &str, _model: &str, vector: &[f32]) -> Result<i64> {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(
            ordinal,
            StoredVector {
                chunk_id: chunk_id.to_string(),
                vector: vector.to_vec(),
            },
        );
        Ok(ordinal)
    }

    async fn remove(&self, ordinals: &[i64]) -> Result<usize> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        Ok(ordinals
            .iter()
            .filter(|o| entries.remove(o).is_some())
            .count())
    }

    async fn entries(&self) -> Result<Vec<VectorEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .iter()
            .map(|(ordinal, sv)| VectorEntry {
                ordinal: *ordinal,
                chunk_id: sv.chunk_id.clone(),
            })
            .collect())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        allowed: &HashSet<i64>,
    ) -> Result<Vec<VectorHit>> {
        let entries = self.entries.read().map_err(poisoned)?;
        let hits: Vec<VectorHit> = entries
            .iter()
            .filter(|(ordinal, _)| allowed.contains(ordinal))
            .map(|(ordinal, sv)| VectorHit {
                ordinal: *ordinal,
                score: cosine_similarity(query, &sv.vector),
            })
            .collect();
        Ok(top_k_with_ties(hits, k))
    }

    async fn len(&self) -> Result<usize> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanMode;

    fn doc(path: &str, modified_at: i64) -> Document {
        Document {
            path: PathBuf::from(path),
            title: None,
            content_hash: "h".to_string(),
            size_bytes: 1,
            modified_at,
            format: "text".to_string(),
            scan_mode: ScanMode::Manual,
            status: DocumentStatus::Indexed,
            error: None,
            updated_at: 0,
        }
    }

    fn chunk(id: &str, document_id: &str, seq: u32) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: document_id.to_string(),
            seq,
            start: 0,
            end: 4,
            length: 4,
            text: "text".to_string(),
            hash: "t".to_string(),
        }
    }

    #[tokio::test]
    async fn pending_rows_are_not_committed_entries() {
        let store = InMemoryMetadataStore::new();
        store.put_document(&doc("/a.md", 10)).await.unwrap();
        store.insert_pending_chunk(&chunk("c1", "/a.md", 0), "m", 0).await.unwrap();
        store.insert_pending_chunk(&chunk("c2", "/a.md", 1), "m", 0).await.unwrap();
        store.mark_committed("c2", 7).await.unwrap();

        let entries = store
            .committed_entries(&RetrievalFilter::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].chunk_id, "c2");
        assert_eq!(entries[0].ordinal, 7);
        assert_eq!(entries[0].modified_at, 10);
    }

    #[tokio::test]
    async fn only_indexed_documents_are_retrievable() {
        let store = InMemoryMetadataStore::new();
        store.put_document(&doc("/done.md", 10)).await.unwrap();
        let mut writing = doc("/writing.md", 10);
        writing.status = DocumentStatus::Chunked;
        store.put_document(&writing).await.unwrap();

        store.insert_pending_chunk(&chunk("c1", "/done.md", 0), "m", 0).await.unwrap();
        store.mark_committed("c1", 1).await.unwrap();
        store.insert_pending_chunk(&chunk("c2", "/writing.md", 0), "m", 0).await.unwrap();
        store.mark_committed("c2", 2).await.unwrap();

        let all = store
            .committed_entries(&RetrievalFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let visible = store
            .retrievable_entries(&RetrievalFilter::default())
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn delete_document_chunks_returns_committed_ordinals() {
        let store = InMemoryMetadataStore::new();
        store.insert_pending_chunk(&chunk("c1", "/a.md", 0), "m", 0).await.unwrap();
        store.insert_pending_chunk(&chunk("c2", "/a.md", 1), "m", 0).await.unwrap();
        store.insert_pending_chunk(&chunk("c3", "/b.md", 0), "m", 0).await.unwrap();
        store.mark_committed("c1", 3).await.unwrap();

        let ordinals = store.delete_document_chunks("/a.md").await.unwrap();
        assert_eq!(ordinals, vec![3]);
        assert!(store.chunks_for_document("/a.md").await.unwrap().is_empty());
        assert_eq!(store.chunks_for_document("/b.md").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retired_embeddings_are_not_served_or_overwritten() {
        let store = InMemoryMetadataStore::new();
        store.cache_embedding("h", "m1", &[1.0, 0.0], 0).await.unwrap();
        assert_eq!(store.retire_embeddings("m1", 1).await.unwrap(), 1);
        assert!(store.cached_embedding("h", "m1").await.unwrap().is_none());

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.retired_embeddings, 1);
        assert_eq!(counts.cached_embeddings, 0);
    }

    #[tokio::test]
    async fn vector_ordinals_are_never_reused() {
        let index = InMemoryVectorIndex::new();
        let a = index.insert("c1", "m", &[1.0]).await.unwrap();
        index.remove(&[a]).await.unwrap();
        let b = index.insert("c2", "m", &[1.0]).await.unwrap();
        assert!(b > a);
        assert_eq!(index.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_only_ranks_allowed_ordinals() {
        let index = InMemoryVectorIndex::new();
        let a = index.insert("c1", "m", &[1.0, 0.0]).await.unwrap();
        let b = index.insert("c2", "m", &[0.9, 0.1]).await.unwrap();
        let allowed: HashSet<i64> = [b].into_iter().collect();

        let hits = index.search(&[1.0, 0.0], 5, &allowed).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ordinal, b);
        assert_ne!(hits[0].ordinal, a);
    }
}
