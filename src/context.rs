//! The explicit knowledge-base handle.
//!
//! [`KnowledgeBase`] bundles everything a command needs: the configuration,
//! both durable stores behind a [`Catalog`], the embedder, the loader
//! registry and the license gate. Components receive it (or the parts they
//! need) as arguments; there is no process-wide index handle.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use localrag_core::catalog::{Catalog, ReconcileReport};
use localrag_core::embedding::Embedder;
use localrag_core::license::LicenseGate;
use localrag_core::query::{Generator, QueryOrchestrator};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::license::create_gate;
use crate::loader::LoaderRegistry;
use crate::sqlite_store::SqliteMetadataStore;
use crate::vector_index::SqliteVectorIndex;

pub struct KnowledgeBase {
    pub config: Config,
    meta: Arc<SqliteMetadataStore>,
    index: Arc<SqliteVectorIndex>,
    catalog: Catalog,
    embedder: Arc<dyn Embedder>,
    loaders: Arc<LoaderRegistry>,
    gate: Arc<dyn LicenseGate>,
}

impl KnowledgeBase {
    /// Open (creating if needed) both stores and build the collaborators
    /// named in `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let meta = Arc::new(SqliteMetadataStore::open(&config).await?);
        let index = Arc::new(SqliteVectorIndex::open(&config).await?);
        let catalog = Catalog::new(meta.clone(), index.clone());
        let embedder = create_embedder(&config.embedding)?;
        let gate = create_gate(&config.license);
        Ok(Self {
            config,
            meta,
            index,
            catalog,
            embedder,
            loaders: Arc::new(LoaderRegistry::with_defaults()),
            gate,
        })
    }

    /// Replace the configured embedder.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Replace the configured license gate.
    pub fn with_gate(mut self, gate: Arc<dyn LicenseGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn loaders(&self) -> &Arc<LoaderRegistry> {
        &self.loaders
    }

    pub fn gate(&self) -> &Arc<dyn LicenseGate> {
        &self.gate
    }

    /// Run the reconciliation pass with the configured grace period.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let now = chrono::Utc::now().timestamp();
        let report = self
            .catalog
            .reconcile(self.config.indexing.pending_grace_secs, now)
            .await?;
        if report.needs_repair {
            warn!(
                dangling = report.dangling_chunks,
                "index corruption detected; run `lrag reconcile --repair`"
            );
        } else if report.purged_pending > 0
            || report.reset_documents > 0
            || report.removed_orphan_vectors > 0
        {
            info!(
                purged_pending = report.purged_pending,
                reset_documents = report.reset_documents,
                orphan_vectors = report.removed_orphan_vectors,
                "reconciled index"
            );
        }
        Ok(report)
    }

    pub fn query_orchestrator(&self, generator: Arc<dyn Generator>) -> QueryOrchestrator {
        QueryOrchestrator::new(
            self.catalog.clone(),
            self.embedder.clone(),
            generator,
            self.gate.clone(),
            self.config.retrieval.to_settings(),
        )
    }

    /// On-disk sizes of the metadata and vector files, in bytes.
    pub fn store_sizes(&self) -> (u64, u64) {
        let size = |p: &std::path::Path| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
        (
            size(&self.config.db.path),
            size(&self.config.db.vector_path()),
        )
    }

    pub async fn close(&self) {
        self.meta.close().await;
        self.index.close().await;
    }
}
