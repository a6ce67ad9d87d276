//! Core data models for the knowledge base.
//!
//! These types flow through the whole pipeline: the loader produces
//! [`LoadedText`], the chunker turns it into [`Chunk`]s owned by a
//! [`Document`], the catalog persists them with a [`ChunkStatus`], and the
//! retriever returns [`RetrievalResult`]s carrying a [`Citation`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a document in the metadata store.
///
/// Transitions are monotonic except for the `Stale` cycle taken when a
/// document's content hash changes, its embeddings are retired, or a failed
/// document is explicitly retried. See [`DocumentStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentStatus {
    Discovered,
    Loading,
    Chunked,
    Indexed,
    /// Loaded successfully but produced no text, so it owns zero chunks.
    IndexedEmpty,
    Failed,
    Stale,
    Removed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Discovered => "discovered",
            DocumentStatus::Loading => "loading",
            DocumentStatus::Chunked => "chunked",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::IndexedEmpty => "indexed-empty",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Stale => "stale",
            DocumentStatus::Removed => "removed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// ```text
    /// discovered ─▶ loading ─▶ chunked ─▶ indexed | indexed-empty
    ///      │           │          │
    ///      └───────────┴──────────┴─▶ failed
    /// indexed | indexed-empty | failed | loading | chunked ─▶ stale
    /// stale ─▶ loading | removed
    /// removed ─▶ discovered
    /// ```
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Discovered, Loading)
                | (Discovered, Failed)
                | (Loading, Chunked)
                | (Loading, IndexedEmpty)
                | (Loading, Failed)
                | (Chunked, Indexed)
                | (Chunked, Failed)
                | (Indexed, Stale)
                | (IndexedEmpty, Stale)
                | (Failed, Stale)
                | (Loading, Stale)
                | (Chunked, Stale)
                | (Discovered, Stale)
                | (Stale, Loading)
                | (Stale, Removed)
                | (Removed, Discovered)
        )
    }

    /// Terminal states of a completed indexing attempt.
    ///
    /// A document in one of these states with an unchanged content hash is
    /// skipped by the scan fast path.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Indexed | DocumentStatus::IndexedEmpty | DocumentStatus::Failed
        )
    }

    /// States an interrupted run can leave behind.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Discovered | DocumentStatus::Loading | DocumentStatus::Chunked
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(DocumentStatus::Discovered),
            "loading" => Ok(DocumentStatus::Loading),
            "chunked" => Ok(DocumentStatus::Chunked),
            "indexed" => Ok(DocumentStatus::Indexed),
            "indexed-empty" => Ok(DocumentStatus::IndexedEmpty),
            "failed" => Ok(DocumentStatus::Failed),
            "stale" => Ok(DocumentStatus::Stale),
            "removed" => Ok(DocumentStatus::Removed),
            other => Err(format!("unknown document status: {}", other)),
        }
    }
}

/// Traversal policy of an indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// One configured directory.
    Manual,
    /// The current user's home directory.
    Home,
    /// Every filesystem root.
    System,
    /// A configured list of paths.
    Custom,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Manual => "manual",
            ScanMode::Home => "home",
            ScanMode::System => "system",
            ScanMode::Custom => "custom",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ScanMode::Manual),
            "home" => Ok(ScanMode::Home),
            "system" => Ok(ScanMode::System),
            "custom" => Ok(ScanMode::Custom),
            other => Err(format!(
                "unknown scan mode '{}': expected manual, home, system, or custom",
                other
            )),
        }
    }
}

/// What a scan does when it meets a directory or file it may not read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPolicy {
    /// Record the denial in the scan report and keep walking.
    #[default]
    Skip,
    /// Stop traversal at the first denial.
    Abort,
}

impl FromStr for PermissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(PermissionPolicy::Skip),
            "abort" => Ok(PermissionPolicy::Abort),
            other => Err(format!(
                "unknown permission policy '{}': expected skip or abort",
                other
            )),
        }
    }
}

/// A source file tracked by the metadata store.
///
/// The canonical path is the identifier; `status` is the only field that
/// changes without a new content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Canonical path, used as the document identifier.
    pub path: PathBuf,
    pub title: Option<String>,
    /// SHA-256 of the file bytes.
    pub content_hash: String,
    pub size_bytes: u64,
    /// Modification time, unix seconds.
    pub modified_at: i64,
    /// Loader format identifier (e.g. `"markdown"`, `"pdf"`).
    pub format: String,
    pub scan_mode: ScanMode,
    pub status: DocumentStatus,
    /// Failure cause, populated when `status` is `Failed`.
    pub error: Option<String>,
    /// Last status change, unix seconds.
    pub updated_at: i64,
}

impl Document {
    /// The identifier under which chunks reference this document.
    pub fn id(&self) -> String {
        document_id(&self.path)
    }

    /// Returns a copy in `status`, stamped with `now`.
    pub fn with_status(&self, status: DocumentStatus, now: i64) -> Document {
        Document {
            status,
            updated_at: now,
            error: if status == DocumentStatus::Failed {
                self.error.clone()
            } else {
                None
            },
            ..self.clone()
        }
    }
}

/// Identifier string for a document path.
pub fn document_id(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

/// A contiguous span of a document's text.
///
/// Chunk identifiers are content addressed: the same document, sequence
/// index and text always produce the same identifier. Offsets are measured
/// in characters (Unicode scalar values) into the loaded text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Zero-based position within the document.
    pub seq: u32,
    /// Start offset (inclusive), in characters.
    pub start: usize,
    /// End offset (exclusive), in characters.
    pub end: usize,
    /// Size in the configured chunking unit (tokens or characters).
    pub length: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Persistence state of a chunk row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// Metadata written, vector not yet confirmed.
    Pending,
    /// Vector present in the index at the recorded ordinal.
    Committed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Committed => "committed",
        }
    }
}

impl FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChunkStatus::Pending),
            "committed" => Ok(ChunkStatus::Committed),
            other => Err(format!("unknown chunk status: {}", other)),
        }
    }
}

/// A chunk as stored, with its commit state.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub status: ChunkStatus,
    /// Vector index ordinal, set once committed.
    pub ordinal: Option<i64>,
    /// Embedding model the vector was produced with.
    pub model: String,
    /// Row creation time, unix seconds.
    pub created_at: i64,
}

/// A page, slide, sheet or heading-delimited region of loaded text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    pub label: String,
    /// Start offset, in characters.
    pub start: usize,
    /// End offset (exclusive), in characters.
    pub end: usize,
}

/// Output of a loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedText {
    pub text: String,
    pub title: Option<String>,
    /// Empty when the format has no page or section structure.
    pub sections: Vec<Section>,
}

/// Metadata filter applied to the committed set before ranking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalFilter {
    /// Only documents under this path.
    pub path_prefix: Option<PathBuf>,
    /// Only documents modified at or after this unix timestamp.
    pub modified_since: Option<i64>,
}

impl RetrievalFilter {
    pub fn matches(&self, path: &std::path::Path, modified_at: i64) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix) {
                return false;
            }
        }
        if let Some(since) = self.modified_since {
            if modified_at < since {
                return false;
            }
        }
        true
    }
}

/// Provenance of a retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub path: PathBuf,
    pub title: Option<String>,
    /// Start offset, in characters.
    pub start: usize,
    /// End offset (exclusive), in characters.
    pub end: usize,
    pub snippet: String,
    pub score: f32,
}

/// One ranked hit from the retriever.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    pub score: f32,
    /// One-based rank.
    pub rank: usize,
    /// Full chunk text, used for context assembly.
    #[serde(skip)]
    pub text: String,
    pub citation: Citation,
}
