//! Retriever: query vector to ranked, cited chunks.
//!
//! Operates entirely through a [`Catalog`], with no database or embedding
//! dependencies. The caller embeds the query.
//!
//! # Algorithm
//!
//! 1. Load the committed chunks of `indexed` documents, restricted by the
//!    [`RetrievalFilter`]; the filter is applied before ranking, so excluded
//!    documents never take a slot from eligible ones.
//! 2. Search the vector index over those ordinals only. The index returns
//!    the top `k` plus anything tied with the k-th score.
//! 3. Drop hits below `min_similarity`.
//! 4. Sort by score (desc), document modification time (desc), chunk id
//!    (asc). Truncate to `k`.
//! 5. Re-read each chunk row and its document and build the citation. A row
//!    deleted or replaced since step 1, or a document no longer `indexed`,
//!    is dropped rather than returned.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;

use crate::catalog::Catalog;
use crate::error::QueryError;
use crate::models::{ChunkStatus, Citation, DocumentStatus, RetrievalFilter, RetrievalResult};
use crate::store::CommittedEntry;

/// Largest accepted result count.
pub const MAX_K: usize = 100;

/// Default citation snippet length, in characters.
pub const DEFAULT_SNIPPET_CHARS: usize = 200;

/// Inputs for one retrieval.
#[derive(Debug, Clone)]
pub struct RetrieveRequest<'a> {
    pub query_vec: &'a [f32],
    pub k: usize,
    pub filter: &'a RetrievalFilter,
    pub min_similarity: Option<f32>,
    pub snippet_chars: usize,
}

/// Rank committed chunks against `req.query_vec`.
///
/// Returns an empty vector for an empty (or fully filtered) index.
///
/// # Errors
///
/// [`QueryError::InvalidLimit`] when `k` is zero or above [`MAX_K`];
/// store errors otherwise.
pub async fn retrieve(catalog: &Catalog, req: &RetrieveRequest<'_>) -> Result<Vec<RetrievalResult>> {
    if req.k == 0 || req.k > MAX_K {
        return Err(QueryError::InvalidLimit {
            got: req.k,
            max: MAX_K,
        }
        .into());
    }

    let committed = catalog.metadata().retrievable_entries(req.filter).await?;
    if committed.is_empty() {
        return Ok(Vec::new());
    }

    let by_ordinal: HashMap<i64, &CommittedEntry> =
        committed.iter().map(|e| (e.ordinal, e)).collect();
    let allowed: HashSet<i64> = by_ordinal.keys().copied().collect();

    let hits = catalog
        .index()
        .search(req.query_vec, req.k, &allowed)
        .await?;

    let mut scored: Vec<(f32, &CommittedEntry)> = hits
        .iter()
        .filter(|h| req.min_similarity.map_or(true, |min| h.score >= min))
        .filter_map(|h| by_ordinal.get(&h.ordinal).map(|e| (h.score, *e)))
        .collect();

    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then(b.1.modified_at.cmp(&a.1.modified_at))
            .then(a.1.chunk_id.cmp(&b.1.chunk_id))
    });
    scored.truncate(req.k);

    let mut titles: HashMap<PathBuf, Option<Option<String>>> = HashMap::new();
    let mut results = Vec::with_capacity(scored.len());

    for (score, entry) in scored {
        let Some(record) = catalog.metadata().get_chunk(&entry.chunk_id).await? else {
            continue;
        };
        if record.status != ChunkStatus::Committed || record.ordinal != Some(entry.ordinal) {
            continue;
        }

        let title = match titles.get(&entry.path) {
            Some(t) => t.clone(),
            None => {
                let t = catalog
                    .metadata()
                    .get_document(&entry.path)
                    .await?
                    .filter(|d| d.status == DocumentStatus::Indexed)
                    .map(|d| d.title);
                titles.insert(entry.path.clone(), t.clone());
                t
            }
        };
        let Some(title) = title else {
            continue;
        };

        let chunk = record.chunk;
        results.push(RetrievalResult {
            chunk_id: chunk.id.clone(),
            score,
            rank: results.len() + 1,
            citation: Citation {
                path: entry.path.clone(),
                title,
                start: chunk.start,
                end: chunk.end,
                snippet: make_snippet(&chunk.text, req.snippet_chars),
                score,
            },
            text: chunk.text,
        });
    }

    Ok(results)
}

/// First `max_chars` characters of `text` with whitespace runs collapsed.
pub fn make_snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max_chars).collect();
    out.push('…');
    out
}
