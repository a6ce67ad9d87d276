//! Document lookup by path.
//!
//! Fetches a document's row and its chunk rows from the metadata store.
//! Used by the `lrag get` command.

use std::path::Path;

use anyhow::{bail, Result};
use serde::Serialize;

use localrag_core::models::ChunkStatus;

use crate::context::KnowledgeBase;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub path: String,
    pub title: Option<String>,
    pub format: String,
    pub status: String,
    pub error: Option<String>,
    pub content_hash: String,
    pub size_bytes: u64,
    pub scan_mode: String,
    pub modified_at: String, // ISO8601
    pub updated_at: String,  // ISO8601
    pub chunks: Vec<ChunkResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub seq: u32,
    pub start: usize,
    pub end: usize,
    pub committed: bool,
    pub text: String,
}

/// Look up `path` (canonicalized when it exists on disk).
pub async fn get_document(kb: &KnowledgeBase, path: &Path) -> Result<DocumentResponse> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let meta = kb.catalog().metadata();
    let Some(doc) = meta.get_document(&key).await? else {
        bail!("document not found: {}", path.display());
    };

    let chunks = meta
        .chunks_for_document(&doc.id())
        .await?
        .into_iter()
        .map(|r| ChunkResponse {
            seq: r.chunk.seq,
            start: r.chunk.start,
            end: r.chunk.end,
            committed: r.status == ChunkStatus::Committed,
            text: r.chunk.text,
        })
        .collect();

    Ok(DocumentResponse {
        path: doc.path.display().to_string(),
        title: doc.title.clone(),
        format: doc.format.clone(),
        status: doc.status.to_string(),
        error: doc.error.clone(),
        content_hash: doc.content_hash.clone(),
        size_bytes: doc.size_bytes,
        scan_mode: doc.scan_mode.to_string(),
        modified_at: format_ts_iso(doc.modified_at),
        updated_at: format_ts_iso(doc.updated_at),
        chunks,
    })
}

/// CLI entry point — calls get_document and prints to stdout.
pub async fn run_get(kb: &KnowledgeBase, path: &Path, show_chunks: bool) -> Result<()> {
    let doc = get_document(kb, path).await?;

    println!("--- Document ---");
    println!("path:         {}", doc.path);
    println!(
        "title:        {}",
        doc.title.as_deref().unwrap_or("(untitled)")
    );
    println!("format:       {}", doc.format);
    println!("status:       {}", doc.status);
    if let Some(ref err) = doc.error {
        println!("error:        {}", err);
    }
    println!("size:         {}", crate::stats::format_bytes(doc.size_bytes));
    println!("hash:         {}", doc.content_hash);
    println!("scan_mode:    {}", doc.scan_mode);
    println!("modified_at:  {}", doc.modified_at);
    println!("updated_at:   {}", doc.updated_at);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    if show_chunks {
        for chunk in &doc.chunks {
            let state = if chunk.committed { "" } else { " pending" };
            println!("[chunk {} chars {}..{}{}]", chunk.seq, chunk.start, chunk.end, state);
            println!("{}", chunk.text);
            println!();
        }
    }

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
