//! Query orchestrator.
//!
//! Encodes the question, retrieves the top-k committed chunks, assembles
//! them into a bounded context and hands `(question, context)` to a
//! [`Generator`]. An empty retrieval short-circuits with
//! [`NO_RELEVANT_INFORMATION`] and never reaches the generator.
//!
//! # Context budget
//!
//! Blocks are rendered as `[label]\n{text}` and joined by a blank line.
//! They are added in rank order while the rendered context stays within
//! `max_context_chars`, so the lowest-ranked chunks are the first to go.
//! If the top chunk alone exceeds the budget its text is truncated to fit.
//! When not even its label fits, the answer is [`NO_RELEVANT_INFORMATION`]
//! and the generator is not called. Only the citations of blocks that made
//! it into the context are returned.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::catalog::Catalog;
use crate::embedding::{validate_batch, Embedder};
use crate::error::QueryError;
use crate::license::{require, LicenseGate, OP_QUERY};
use crate::models::{Citation, RetrievalFilter, RetrievalResult};
use crate::retrieve::{retrieve, RetrieveRequest, MAX_K};

/// Answer returned when nothing relevant is indexed.
pub const NO_RELEVANT_INFORMATION: &str =
    "No relevant information was found in the indexed documents.";

const BLOCK_SEPARATOR: &str = "\n\n";

/// One retrieved passage as presented to the generator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextBlock {
    /// Document title, or file name when the document has none.
    pub label: String,
    pub text: String,
}

impl ContextBlock {
    pub fn render(&self) -> String {
        format!("[{}]\n{}", self.label, self.text)
    }

    fn rendered_len(&self) -> usize {
        self.label.chars().count() + 3 + self.text.chars().count()
    }
}

/// Join blocks into the context string handed to generation.
pub fn render_context(blocks: &[ContextBlock]) -> String {
    blocks
        .iter()
        .map(ContextBlock::render)
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR)
}

fn block_label(result: &RetrievalResult) -> String {
    match &result.citation.title {
        Some(t) if !t.trim().is_empty() => t.clone(),
        _ => result
            .citation
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| result.citation.path.display().to_string()),
    }
}

/// Pack ranked results into at most `max_chars` of rendered context.
///
/// Returns the blocks in rank order; `blocks.len()` results were used.
pub fn assemble_context(results: &[RetrievalResult], max_chars: usize) -> Vec<ContextBlock> {
    let mut blocks = Vec::new();
    let mut used = 0usize;

    for result in results {
        let block = ContextBlock {
            label: block_label(result),
            text: result.text.clone(),
        };
        let sep = if blocks.is_empty() {
            0
        } else {
            BLOCK_SEPARATOR.len()
        };
        let len = block.rendered_len();

        if used + sep + len <= max_chars {
            used += sep + len;
            blocks.push(block);
            continue;
        }

        if blocks.is_empty() {
            let room = max_chars.saturating_sub(block.label.chars().count() + 3);
            if room > 0 {
                blocks.push(ContextBlock {
                    text: block.text.chars().take(room).collect(),
                    label: block.label,
                });
            }
        }
        break;
    }

    blocks
}

/// Produces an answer from a question and its context.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Short identifier for logs (e.g. `"ollama:llama3"`).
    fn name(&self) -> &str;

    async fn generate(&self, question: &str, context: &[ContextBlock]) -> Result<String>;
}

/// Retrieval knobs for the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySettings {
    pub top_k: usize,
    pub min_similarity: Option<f32>,
    pub max_context_chars: usize,
    pub snippet_chars: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: None,
            max_context_chars: 6000,
            snippet_chars: crate::retrieve::DEFAULT_SNIPPET_CHARS,
        }
    }
}

/// A query from the caller.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub question: String,
    /// Result count; `None` uses [`QuerySettings::top_k`].
    pub k: Option<usize>,
    pub filter: RetrievalFilter,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }
}

/// The orchestrator's response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    /// Citations of the chunks actually placed in the context, in rank order.
    pub citations: Vec<Citation>,
    /// False when the no-information short circuit was taken.
    pub generated: bool,
}

/// Read-path entry point. Holds explicit handles, no global state.
pub struct QueryOrchestrator {
    catalog: Catalog,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    gate: Arc<dyn LicenseGate>,
    settings: QuerySettings,
}

impl QueryOrchestrator {
    pub fn new(
        catalog: Catalog,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        gate: Arc<dyn LicenseGate>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            catalog,
            embedder,
            generator,
            gate,
            settings,
        }
    }

    /// Ranked citations without generation.
    pub async fn search(&self, req: &QueryRequest) -> Result<Vec<RetrievalResult>> {
        require(self.gate.as_ref(), OP_QUERY)?;
        let question = req.question.trim();
        if question.is_empty() {
            return Err(QueryError::Empty.into());
        }
        let k = req.k.unwrap_or(self.settings.top_k);
        if k == 0 || k > MAX_K {
            return Err(QueryError::InvalidLimit { got: k, max: MAX_K }.into());
        }
        if let Some(prefix) = &req.filter.path_prefix {
            if !prefix.is_absolute() {
                return Err(QueryError::InvalidFilter(format!(
                    "path prefix must be absolute: {}",
                    prefix.display()
                ))
                .into());
            }
        }

        if let Some(active) = self.catalog.active_model().await? {
            if active != self.embedder.model_id() {
                bail!(
                    "index was built with embedding model '{}' but '{}' is configured; run a scan to re-embed",
                    active,
                    self.embedder.model_id()
                );
            }
        }

        let texts = vec![question.to_string()];
        let vectors = self.embedder.embed(&texts).await?;
        validate_batch(1, self.embedder.dims(), &vectors)?;

        retrieve(
            &self.catalog,
            &RetrieveRequest {
                query_vec: &vectors[0],
                k,
                filter: &req.filter,
                min_similarity: self.settings.min_similarity,
                snippet_chars: self.settings.snippet_chars,
            },
        )
        .await
    }

    /// Retrieve, assemble context, and generate a grounded answer.
    pub async fn answer(&self, req: &QueryRequest) -> Result<Answer> {
        let results = self.search(req).await?;
        let blocks = assemble_context(&results, self.settings.max_context_chars);
        if blocks.is_empty() {
            return Ok(Answer {
                answer: NO_RELEVANT_INFORMATION.to_string(),
                citations: Vec::new(),
                generated: false,
            });
        }

        let answer = self.generator.generate(req.question.trim(), &blocks).await?;
        let citations = results
            .into_iter()
            .take(blocks.len())
            .map(|r| r.citation)
            .collect();

        Ok(Answer {
            answer,
            citations,
            generated: true,
        })
    }
}
