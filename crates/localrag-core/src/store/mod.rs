//! Storage abstraction for the knowledge base.
//!
//! Two physically distinct structures back the index:
//!
//! - [`MetadataStore`]: documents, chunk rows with their commit state, the
//!   content-hash embedding cache, and small persistent state flags.
//! - [`VectorIndex`]: dense ordinals mapped to chunk identifiers and vectors,
//!   searched by cosine similarity.
//!
//! Neither trait knows about the other. The write/delete/reconcile protocols
//! that keep them consistent live in [`crate::catalog`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, ChunkRecord, Document, DocumentStatus, RetrievalFilter};

/// A committed chunk as seen by the retriever: enough to rank and
/// tie-break without loading chunk text.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEntry {
    pub ordinal: i64,
    pub chunk_id: String,
    pub document_id: String,
    pub path: PathBuf,
    /// Document modification time, unix seconds.
    pub modified_at: i64,
}

/// A live entry in the vector index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorEntry {
    pub ordinal: i64,
    pub chunk_id: String,
}

/// A similarity hit from the vector index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    pub ordinal: i64,
    pub score: f32,
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreCounts {
    pub documents: Vec<(DocumentStatus, u64)>,
    pub pending_chunks: u64,
    pub committed_chunks: u64,
    pub cached_embeddings: u64,
    pub retired_embeddings: u64,
}

impl StoreCounts {
    pub fn documents_with(&self, status: DocumentStatus) -> u64 {
        self.documents
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

/// Durable record of documents, chunks, and cached embeddings.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_document`](MetadataStore::get_document) | Look up a document by canonical path |
/// | [`put_document`](MetadataStore::put_document) | Insert or replace a document row |
/// | [`list_documents`](MetadataStore::list_documents) | All documents, optionally by status |
/// | [`insert_pending_chunk`](MetadataStore::insert_pending_chunk) | Write protocol step 1 |
/// | [`mark_committed`](MetadataStore::mark_committed) | Write protocol step 4 |
/// | [`delete_document_chunks`](MetadataStore::delete_document_chunks) | Deletion protocol, metadata half |
/// | [`purge_pending`](MetadataStore::purge_pending) | Reconciliation of orphan pending rows |
/// | [`committed_entries`](MetadataStore::committed_entries) | Every committed chunk, for consistency checks |
/// | [`retrievable_entries`](MetadataStore::retrievable_entries) | Filtered committed set of indexed documents |
/// | [`cached_embedding`](MetadataStore::cached_embedding) | Content-hash embedding cache lookup |
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_document(&self, path: &Path) -> Result<Option<Document>>;

    /// Insert or replace the row for `doc.path`.
    async fn put_document(&self, doc: &Document) -> Result<()>;

    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>>;

    /// Insert or overwrite a chunk row in status `pending`, clearing any ordinal.
    async fn insert_pending_chunk(&self, chunk: &Chunk, model: &str, now: i64) -> Result<()>;

    /// Move a chunk row to `committed` at `ordinal`.
    async fn mark_committed(&self, chunk_id: &str, ordinal: i64) -> Result<()>;

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>>;

    /// All chunk rows of a document, ordered by sequence index.
    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<ChunkRecord>>;

    /// Delete every chunk row of a document in one transaction.
    ///
    /// Returns the ordinals the deleted committed rows pointed to.
    async fn delete_document_chunks(&self, document_id: &str) -> Result<Vec<i64>>;

    /// Delete `pending` rows created before `older_than`. Returns the count.
    async fn purge_pending(&self, older_than: i64) -> Result<u64>;

    /// Committed chunks whose document passes `filter`, whatever the
    /// document's status.
    async fn committed_entries(&self, filter: &RetrievalFilter) -> Result<Vec<CommittedEntry>>;

    /// Like [`committed_entries`](MetadataStore::committed_entries), restricted
    /// to documents in status `indexed`. A document still being written or
    /// already tombstoned contributes nothing.
    async fn retrievable_entries(&self, filter: &RetrievalFilter)
        -> Result<Vec<CommittedEntry>>;

    /// Current (non-retired) cached embedding for a chunk text hash.
    async fn cached_embedding(&self, text_hash: &str, model: &str) -> Result<Option<Vec<f32>>>;

    async fn cache_embedding(
        &self,
        text_hash: &str,
        model: &str,
        vector: &[f32],
        now: i64,
    ) -> Result<()>;

    /// Tombstone every cached embedding of `model`. Returns the count.
    async fn retire_embeddings(&self, model: &str, now: i64) -> Result<u64>;

    async fn get_state(&self, key: &str) -> Result<Option<String>>;

    /// Set or (with `None`) clear a persistent state value.
    async fn set_state(&self, key: &str, value: Option<&str>) -> Result<()>;

    async fn counts(&self) -> Result<StoreCounts>;
}

/// Durable nearest-neighbor structure over chunk vectors.
///
/// Ordinals are assigned by the index on insert and never reused.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Append a vector, returning its new ordinal.
    async fn insert(&self, chunk_id: &str, model: &str, vector: &[f32]) -> Result<i64>;

    /// Remove the given ordinals. Unknown ordinals are ignored.
    /// Returns the number removed.
    async fn remove(&self, ordinals: &[i64]) -> Result<usize>;

    /// Every live entry, ordered by ordinal.
    async fn entries(&self) -> Result<Vec<VectorEntry>>;

    /// Rank the `allowed` ordinals by cosine similarity to `query`.
    ///
    /// Returns the top `k` hits, plus any further hits whose score equals
    /// the k-th, so callers can apply their own tie-breaking.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        allowed: &HashSet<i64>,
    ) -> Result<Vec<VectorHit>>;

    async fn len(&self) -> Result<usize>;
}

/// Keep the top `k` hits plus ties with the k-th score.
///
/// Shared by index implementations; `hits` may be in any order. Hits with a
/// non-finite score are dropped.
pub fn top_k_with_ties(mut hits: Vec<VectorHit>, k: usize) -> Vec<VectorHit> {
    hits.retain(|h| h.score.is_finite());
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.ordinal.cmp(&b.ordinal)));
    if k == 0 {
        return Vec::new();
    }
    if hits.len() > k {
        let cutoff = hits[k - 1].score;
        let keep = hits
            .iter()
            .position(|h| h.score < cutoff)
            .unwrap_or(hits.len());
        hits.truncate(keep.max(k));
    }
    hits
}
