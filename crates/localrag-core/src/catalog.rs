//! The consistency core.
//!
//! A [`Catalog`] pairs a [`MetadataStore`] with a [`VectorIndex`] and is the
//! only code that mutates either. It maintains one invariant: the set of live
//! vector ordinals is in bijection with the chunk rows marked `committed`.
//!
//! # Write protocol (per chunk)
//!
//! 1. Insert or overwrite the chunk row as `pending`.
//! 2. Obtain the embedding (supplied by the caller, from cache or embedder).
//! 3. Insert the vector into the index, receiving its ordinal.
//! 4. Mark the row `committed` at that ordinal.
//!
//! A failure anywhere in a document's commit rolls back every row and vector
//! written for that document and marks it `failed`.
//!
//! # Deletion protocol
//!
//! All chunk rows of the document are deleted in one metadata transaction
//! (making them invisible to queries at once), then their ordinals are
//! removed from the index, then the document moves to `stale` and, if the
//! source vanished, on to `removed`. Vectors are never updated in place.
//!
//! # Recovery
//!
//! [`Catalog::reconcile`] is the only recovery path. It purges `pending` rows
//! older than a grace period, resets documents stuck mid-pipeline to
//! `stale`, removes vector ordinals without a committed owner, and flags
//! committed rows that point at missing or foreign vectors as corruption.
//! Corruption blocks all writes until [`Catalog::repair`] runs.
//!
//! The catalog assumes a single writer; callers serialize mutations.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use crate::error::IndexWriteError;
use crate::models::{Chunk, Document, DocumentStatus, RetrievalFilter};
use crate::store::{MetadataStore, VectorIndex};

/// State key holding `"1"` while the index awaits repair.
pub const STATE_NEEDS_REPAIR: &str = "needs_repair";
/// State key holding the embedding model the index was built with.
pub const STATE_ACTIVE_MODEL: &str = "active_model";

/// Result of [`Catalog::verify`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsistencyReport {
    pub committed_chunks: usize,
    pub live_vectors: usize,
    /// Vector ordinals with no committed owner.
    pub orphan_vectors: Vec<i64>,
    /// Committed chunk ids whose ordinal is missing, shared, or holds
    /// another chunk's vector.
    pub dangling_chunks: Vec<String>,
    /// Documents owning dangling chunks.
    pub affected_documents: Vec<PathBuf>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.orphan_vectors.is_empty() && self.dangling_chunks.is_empty()
    }

    pub fn is_corrupt(&self) -> bool {
        !self.dangling_chunks.is_empty()
    }
}

/// Result of [`Catalog::reconcile`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub purged_pending: u64,
    pub reset_documents: usize,
    pub removed_orphan_vectors: usize,
    pub dangling_chunks: usize,
    pub needs_repair: bool,
}

/// Result of [`Catalog::repair`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairReport {
    pub documents_reset: usize,
    pub vectors_removed: usize,
}

/// Result of [`Catalog::activate_model`] when the model changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChange {
    pub previous: String,
    pub retired_embeddings: u64,
    pub invalidated_documents: usize,
}

/// Explicit handle to the paired stores.
#[derive(Clone)]
pub struct Catalog {
    meta: Arc<dyn MetadataStore>,
    index: Arc<dyn VectorIndex>,
}

fn meta_err(e: anyhow::Error) -> IndexWriteError {
    IndexWriteError::Metadata(format!("{:#}", e))
}

fn vector_err(e: anyhow::Error) -> IndexWriteError {
    IndexWriteError::Vector(format!("{:#}", e))
}

impl Catalog {
    pub fn new(meta: Arc<dyn MetadataStore>, index: Arc<dyn VectorIndex>) -> Self {
        Self { meta, index }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.meta
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub async fn needs_repair(&self) -> Result<bool> {
        Ok(self.meta.get_state(STATE_NEEDS_REPAIR).await?.as_deref() == Some("1"))
    }

    async fn ensure_writable(&self) -> Result<(), IndexWriteError> {
        if self.needs_repair().await.map_err(meta_err)? {
            return Err(IndexWriteError::RepairRequired);
        }
        Ok(())
    }

    /// Persist `doc` in status `next`, enforcing the lifecycle.
    ///
    /// A path with no stored row may only enter as `discovered`.
    pub async fn transition(
        &self,
        doc: &Document,
        next: DocumentStatus,
        error: Option<String>,
        now: i64,
    ) -> Result<Document, IndexWriteError> {
        self.ensure_writable().await?;
        let current = self.meta.get_document(&doc.path).await.map_err(meta_err)?;
        let allowed = match &current {
            Some(stored) => stored.status.can_transition_to(next),
            None => next == DocumentStatus::Discovered,
        };
        if !allowed {
            return Err(IndexWriteError::InvalidTransition {
                path: doc.path.clone(),
                from: current
                    .map(|d| d.status.to_string())
                    .unwrap_or_else(|| "(none)".to_string()),
                to: next.to_string(),
            });
        }
        let mut updated = doc.with_status(next, now);
        updated.error = error;
        self.meta.put_document(&updated).await.map_err(meta_err)?;
        Ok(updated)
    }

    /// Run the write protocol for every chunk of `doc` and mark it indexed.
    ///
    /// `doc` must be stored as `chunked`. `vectors[i]` is the embedding of
    /// `chunks[i]`. On failure the document's partial writes are rolled back
    /// and it is marked `failed`.
    pub async fn commit_document(
        &self,
        doc: &Document,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
        now: i64,
    ) -> Result<Document, IndexWriteError> {
        self.ensure_writable().await?;
        if chunks.len() != vectors.len() {
            return Err(IndexWriteError::VectorCountMismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }

        let mut inserted: Vec<i64> = Vec::with_capacity(chunks.len());
        match self
            .write_chunks(chunks, vectors, model, now, &mut inserted)
            .await
        {
            Ok(()) => self.transition(doc, DocumentStatus::Indexed, None, now).await,
            Err(err) => {
                self.rollback(doc, &inserted).await;
                let _ = self
                    .transition(doc, DocumentStatus::Failed, Some(err.to_string()), now)
                    .await;
                Err(err)
            }
        }
    }

    async fn write_chunks(
        &self,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
        now: i64,
        inserted: &mut Vec<i64>,
    ) -> Result<(), IndexWriteError> {
        for (chunk, vector) in chunks.iter().zip(vectors) {
            self.meta
                .insert_pending_chunk(chunk, model, now)
                .await
                .map_err(meta_err)?;
            let ordinal = self
                .index
                .insert(&chunk.id, model, vector)
                .await
                .map_err(vector_err)?;
            inserted.push(ordinal);
            self.meta
                .mark_committed(&chunk.id, ordinal)
                .await
                .map_err(meta_err)?;
        }
        Ok(())
    }

    /// Best-effort removal of a failed commit's rows and vectors. Anything
    /// left behind is an orphan that reconciliation removes.
    async fn rollback(&self, doc: &Document, inserted: &[i64]) {
        let mut ordinals: BTreeSet<i64> = inserted.iter().copied().collect();
        if let Ok(committed) = self.meta.delete_document_chunks(&doc.id()).await {
            ordinals.extend(committed);
        }
        let ordinals: Vec<i64> = ordinals.into_iter().collect();
        let _ = self.index.remove(&ordinals).await;
    }

    /// Run the deletion protocol for `path`.
    ///
    /// `final_status` is `Stale` when the content changed (the caller will
    /// re-create it) or `Removed` when the source vanished. Returns the
    /// number of vectors removed; a path with no stored row is a no-op.
    pub async fn delete_document(
        &self,
        path: &Path,
        final_status: DocumentStatus,
        now: i64,
    ) -> Result<usize, IndexWriteError> {
        self.ensure_writable().await?;
        let Some(doc) = self.meta.get_document(path).await.map_err(meta_err)? else {
            return Ok(0);
        };
        let removed = self.drop_chunks(&doc).await?;

        let mut current = doc;
        if current.status != DocumentStatus::Stale {
            current = self
                .transition(&current, DocumentStatus::Stale, None, now)
                .await?;
        }
        if final_status == DocumentStatus::Removed {
            self.transition(&current, DocumentStatus::Removed, None, now)
                .await?;
        }
        Ok(removed)
    }

    async fn drop_chunks(&self, doc: &Document) -> Result<usize, IndexWriteError> {
        let ordinals = self
            .meta
            .delete_document_chunks(&doc.id())
            .await
            .map_err(meta_err)?;
        if ordinals.is_empty() {
            return Ok(0);
        }
        self.index.remove(&ordinals).await.map_err(vector_err)
    }

    /// Check the dual-store invariant without modifying anything.
    pub async fn verify(&self) -> Result<ConsistencyReport> {
        let committed = self
            .meta
            .committed_entries(&RetrievalFilter::default())
            .await?;
        let vectors = self.index.entries().await?;

        let live: HashMap<i64, &str> = vectors
            .iter()
            .map(|v| (v.ordinal, v.chunk_id.as_str()))
            .collect();

        let mut owners: HashMap<i64, usize> = HashMap::new();
        for entry in &committed {
            *owners.entry(entry.ordinal).or_insert(0) += 1;
        }

        let mut dangling = Vec::new();
        let mut affected: BTreeSet<PathBuf> = BTreeSet::new();
        for entry in &committed {
            let ok = owners.get(&entry.ordinal) == Some(&1)
                && live.get(&entry.ordinal) == Some(&entry.chunk_id.as_str());
            if !ok {
                dangling.push(entry.chunk_id.clone());
                affected.insert(entry.path.clone());
            }
        }

        let owned: HashSet<i64> = committed.iter().map(|e| e.ordinal).collect();
        let orphan_vectors: Vec<i64> = vectors
            .iter()
            .map(|v| v.ordinal)
            .filter(|o| !owned.contains(o))
            .collect();

        Ok(ConsistencyReport {
            committed_chunks: committed.len(),
            live_vectors: vectors.len(),
            orphan_vectors,
            dangling_chunks: dangling,
            affected_documents: affected.into_iter().collect(),
        })
    }

    /// Startup reconciliation. See the module docs.
    pub async fn reconcile(&self, grace_secs: i64, now: i64) -> Result<ReconcileReport> {
        let cutoff = now - grace_secs;
        let mut report = ReconcileReport {
            purged_pending: self.meta.purge_pending(cutoff).await?,
            ..ReconcileReport::default()
        };

        for doc in self.meta.list_documents(None).await? {
            if doc.status.is_in_flight() && doc.updated_at < cutoff {
                let ordinals = self.meta.delete_document_chunks(&doc.id()).await?;
                self.index.remove(&ordinals).await?;
                let stale = doc.with_status(DocumentStatus::Stale, now);
                self.meta.put_document(&stale).await?;
                report.reset_documents += 1;
            }
        }

        let consistency = self.verify().await?;
        if !consistency.orphan_vectors.is_empty() {
            report.removed_orphan_vectors =
                self.index.remove(&consistency.orphan_vectors).await?;
        }
        report.dangling_chunks = consistency.dangling_chunks.len();
        if consistency.is_corrupt() {
            self.meta.set_state(STATE_NEEDS_REPAIR, Some("1")).await?;
        }
        report.needs_repair = self.needs_repair().await?;
        Ok(report)
    }

    /// Explicit repair after corruption: every affected document loses its
    /// chunks and vectors and becomes `stale`, orphan vectors are removed,
    /// and writes are re-enabled.
    pub async fn repair(&self, now: i64) -> Result<RepairReport> {
        let consistency = self.verify().await?;
        let mut report = RepairReport::default();

        for path in &consistency.affected_documents {
            if let Some(doc) = self.meta.get_document(path).await? {
                let ordinals = self.meta.delete_document_chunks(&doc.id()).await?;
                report.vectors_removed += self.index.remove(&ordinals).await?;
                if doc.status != DocumentStatus::Stale {
                    self.meta
                        .put_document(&doc.with_status(DocumentStatus::Stale, now))
                        .await?;
                }
                report.documents_reset += 1;
            }
        }

        let after = self.verify().await?;
        if !after.orphan_vectors.is_empty() {
            report.vectors_removed += self.index.remove(&after.orphan_vectors).await?;
        }
        self.meta.set_state(STATE_NEEDS_REPAIR, None).await?;
        Ok(report)
    }

    /// Record `model` as the active embedding model.
    ///
    /// When it differs from the recorded one, cached embeddings of the old
    /// model are tombstoned and every document holding chunks goes through
    /// the deletion protocol to `stale`, so the index never mixes vector
    /// spaces.
    pub async fn activate_model(&self, model: &str, now: i64) -> Result<Option<ModelChange>> {
        let previous = self.meta.get_state(STATE_ACTIVE_MODEL).await?;
        let previous = match previous {
            None => {
                self.meta.set_state(STATE_ACTIVE_MODEL, Some(model)).await?;
                return Ok(None);
            }
            Some(p) if p == model => return Ok(None),
            Some(p) => p,
        };
        self.ensure_writable().await?;

        let retired = self.meta.retire_embeddings(&previous, now).await?;
        let mut invalidated = 0usize;
        for doc in self.meta.list_documents(None).await? {
            if matches!(doc.status, DocumentStatus::Removed | DocumentStatus::Stale) {
                continue;
            }
            self.delete_document(&doc.path, DocumentStatus::Stale, now)
                .await?;
            invalidated += 1;
        }
        self.meta.set_state(STATE_ACTIVE_MODEL, Some(model)).await?;

        Ok(Some(ModelChange {
            previous,
            retired_embeddings: retired,
            invalidated_documents: invalidated,
        }))
    }

    pub async fn active_model(&self) -> Result<Option<String>> {
        self.meta.get_state(STATE_ACTIVE_MODEL).await
    }
}
