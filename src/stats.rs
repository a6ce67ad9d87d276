//! Index statistics and health overview.
//!
//! Summarizes what's indexed: documents per lifecycle status, chunk and
//! vector counts, cache size, store sizes on disk, the active embedding
//! model and the dual-store consistency check. Used by `lrag stats`.

use anyhow::Result;
use serde::Serialize;

use localrag_core::catalog::ConsistencyReport;
use localrag_core::models::DocumentStatus;

use crate::context::KnowledgeBase;

const STATUS_ORDER: [DocumentStatus; 8] = [
    DocumentStatus::Indexed,
    DocumentStatus::IndexedEmpty,
    DocumentStatus::Failed,
    DocumentStatus::Stale,
    DocumentStatus::Removed,
    DocumentStatus::Discovered,
    DocumentStatus::Loading,
    DocumentStatus::Chunked,
];

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: Vec<(String, u64)>,
    pub committed_chunks: u64,
    pub pending_chunks: u64,
    pub live_vectors: usize,
    pub cached_embeddings: u64,
    pub retired_embeddings: u64,
    pub metadata_bytes: u64,
    pub vector_bytes: u64,
    pub active_model: Option<String>,
    pub needs_repair: bool,
    pub orphan_vectors: usize,
    pub dangling_chunks: usize,
}

pub async fn collect_stats(kb: &KnowledgeBase) -> Result<IndexStats> {
    let catalog = kb.catalog();
    let counts = catalog.metadata().counts().await?;
    let report: ConsistencyReport = catalog.verify().await?;
    let (metadata_bytes, vector_bytes) = kb.store_sizes();

    Ok(IndexStats {
        documents: STATUS_ORDER
            .iter()
            .map(|s| (s.to_string(), counts.documents_with(*s)))
            .filter(|(_, n)| *n > 0)
            .collect(),
        committed_chunks: counts.committed_chunks,
        pending_chunks: counts.pending_chunks,
        live_vectors: report.live_vectors,
        cached_embeddings: counts.cached_embeddings,
        retired_embeddings: counts.retired_embeddings,
        metadata_bytes,
        vector_bytes,
        active_model: catalog.active_model().await?,
        needs_repair: catalog.needs_repair().await?,
        orphan_vectors: report.orphan_vectors.len(),
        dangling_chunks: report.dangling_chunks.len(),
    })
}

/// Run the stats command: collect and print a summary.
pub async fn run_stats(kb: &KnowledgeBase) -> Result<()> {
    let stats = collect_stats(kb).await?;

    println!("localrag — Index Stats");
    println!("======================");
    println!();
    println!("  Metadata:    {} ({})", kb.config.db.path.display(), format_bytes(stats.metadata_bytes));
    println!(
        "  Vectors:     {} ({})",
        kb.config.db.vector_path().display(),
        format_bytes(stats.vector_bytes)
    );
    println!(
        "  Model:       {}",
        stats.active_model.as_deref().unwrap_or("(none yet)")
    );
    println!();

    let total: u64 = stats.documents.iter().map(|(_, n)| n).sum();
    println!("  Documents:   {}", total);
    for (status, n) in &stats.documents {
        println!("    {:<14} {:>8}", status, n);
    }
    println!("  Chunks:      {} committed, {} pending", stats.committed_chunks, stats.pending_chunks);
    println!("  Vectors:     {}", stats.live_vectors);
    println!(
        "  Cache:       {} embeddings ({} retired)",
        stats.cached_embeddings, stats.retired_embeddings
    );
    println!();

    let consistency = if stats.needs_repair {
        "REPAIR REQUIRED (run `lrag reconcile --repair`)".to_string()
    } else if stats.orphan_vectors == 0 && stats.dangling_chunks == 0 {
        "ok".to_string()
    } else {
        format!(
            "{} orphan vectors, {} dangling chunks (run `lrag reconcile`)",
            stats.orphan_vectors, stats.dangling_chunks
        )
    };
    println!("  Consistency: {}", consistency);
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
