//! TOML configuration.
//!
//! Every section except `[db]` is optional and every field has a named
//! default. [`load_config`] parses the file and then validates value ranges,
//! naming the offending key in the error.
//!
//! ```toml
//! [db]
//! path = "./data/localrag.sqlite"
//!
//! [chunking]
//! unit = "tokens"
//! window = 256
//! overlap_fraction = 0.15
//!
//! [embedding]
//! provider = "local"
//! model = "all-minilm-l6-v2"
//!
//! [scan]
//! mode = "manual"
//! root = "~/Documents"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use localrag_core::chunk::{ChunkParams, ChunkUnit};
use localrag_core::models::{PermissionPolicy, ScanMode};
use localrag_core::query::QuerySettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub license: LicenseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Metadata store (documents, chunks, embedding cache).
    pub path: PathBuf,
    /// Vector index; defaults to `vectors.sqlite` beside `path`.
    #[serde(default)]
    pub vector_path: Option<PathBuf>,
}

impl DbConfig {
    pub fn vector_path(&self) -> PathBuf {
        match &self.vector_path {
            Some(p) => p.clone(),
            None => self
                .path
                .parent()
                .map(|dir| dir.join("vectors.sqlite"))
                .unwrap_or_else(|| PathBuf::from("vectors.sqlite")),
        }
    }
}

// ============ Chunking ============

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub unit: ChunkUnit,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f32,
    #[serde(default = "default_boundary_tolerance")]
    pub boundary_tolerance: f32,
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            unit: ChunkUnit::default(),
            window: default_window(),
            overlap_fraction: default_overlap_fraction(),
            boundary_tolerance: default_boundary_tolerance(),
            min_chunk_chars: default_min_chunk_chars(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
        }
    }
}

impl ChunkingConfig {
    pub fn to_params(&self) -> ChunkParams {
        ChunkParams {
            unit: self.unit,
            window: self.window,
            overlap_fraction: self.overlap_fraction,
            boundary_tolerance: self.boundary_tolerance,
            min_chunk_chars: self.min_chunk_chars,
            max_chunks: self.max_chunks_per_doc,
        }
    }
}

fn default_window() -> usize {
    256
}
fn default_overlap_fraction() -> f32 {
    0.15
}
fn default_boundary_tolerance() -> f32 {
    0.2
}
fn default_min_chunk_chars() -> usize {
    40
}
fn default_max_chunks_per_doc() -> usize {
    2000
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash`, `ollama`, or `local`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Ollama base URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    250
}
fn default_backoff_max_ms() -> u64 {
    8000
}
fn default_embed_timeout_secs() -> u64 {
    60
}

// ============ Scan ============

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_scan_mode")]
    pub mode: ScanMode,
    /// Directory for `manual` mode.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Directories for `custom` mode.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub on_permission_denied: PermissionPolicy,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Subtrees never entered (pseudo-filesystems in `system` mode).
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: default_scan_mode(),
            root: None,
            paths: Vec::new(),
            include_globs: default_include_globs(),
            exclude_globs: default_exclude_globs(),
            max_depth: default_max_depth(),
            follow_symlinks: false,
            on_permission_denied: PermissionPolicy::default(),
            max_file_bytes: default_max_file_bytes(),
            skip_paths: default_skip_paths(),
        }
    }
}

fn default_scan_mode() -> ScanMode {
    ScanMode::Manual
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.txt",
        "**/*.md",
        "**/*.markdown",
        "**/*.pdf",
        "**/*.docx",
        "**/*.pptx",
        "**/*.xlsx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_globs() -> Vec<String> {
    [
        "**/.git",
        "**/.git/**",
        "**/node_modules",
        "**/node_modules/**",
        "**/target",
        "**/target/**",
        "**/.cache",
        "**/.cache/**",
        "**/__pycache__",
        "**/__pycache__/**",
        "**/.venv",
        "**/.venv/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_depth() -> usize {
    32
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_skip_paths() -> Vec<PathBuf> {
    ["/proc", "/sys", "/dev", "/run"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

// ============ Indexing ============

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Concurrent document workers (load, chunk, embed).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded depth of the embedding request queue.
    #[serde(default = "default_embed_queue_depth")]
    pub embed_queue_depth: usize,
    /// Bounded depth of the single-writer commit queue.
    #[serde(default = "default_commit_queue_depth")]
    pub commit_queue_depth: usize,
    /// Age after which reconciliation treats pending rows as orphans.
    #[serde(default = "default_pending_grace_secs")]
    pub pending_grace_secs: i64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            embed_queue_depth: default_embed_queue_depth(),
            commit_queue_depth: default_commit_queue_depth(),
            pending_grace_secs: default_pending_grace_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_embed_queue_depth() -> usize {
    16
}
fn default_commit_queue_depth() -> usize {
    64
}
fn default_pending_grace_secs() -> i64 {
    300
}

// ============ Retrieval ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_similarity: Option<f32>,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_similarity: None,
            max_context_chars: default_max_context_chars(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

impl RetrievalConfig {
    pub fn to_settings(&self) -> QuerySettings {
        QuerySettings {
            top_k: self.top_k,
            min_similarity: self.min_similarity,
            max_context_chars: self.max_context_chars,
            snippet_chars: self.snippet_chars,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_context_chars() -> usize {
    6000
}
fn default_snippet_chars() -> usize {
    200
}

// ============ Generation ============

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `none` (extractive) or `ollama`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            system_prompt: default_system_prompt(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "none".to_string()
}
fn default_system_prompt() -> String {
    "You are a helpful assistant that answers questions using only the provided \
     document excerpts. If the excerpts do not contain the answer, say so."
        .to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.2
}
fn default_generation_timeout_secs() -> u64 {
    120
}

// ============ License / Logging ============

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LicenseConfig {
    /// When set, operations require this file to exist and be non-empty.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    config
        .chunking
        .to_params()
        .validate()
        .map_err(|e| anyhow::anyhow!("[chunking] {}", e))?;

    // Embedding
    match config.embedding.provider.as_str() {
        "hash" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, ollama, or local.",
            other
        ),
    }
    if config.embedding.provider == "ollama" {
        if config.embedding.model.is_none() {
            bail!("embedding.model must be specified when provider is 'ollama'");
        }
        if config.embedding.dims.is_none() {
            bail!("embedding.dims must be specified when provider is 'ollama'");
        }
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_attempts == 0 {
        bail!("embedding.max_attempts must be >= 1");
    }

    // Scan
    if config.scan.max_depth == 0 {
        bail!("scan.max_depth must be >= 1");
    }

    // Indexing
    if config.indexing.workers == 0 {
        bail!("indexing.workers must be >= 1");
    }
    if config.indexing.embed_queue_depth == 0 || config.indexing.commit_queue_depth == 0 {
        bail!("indexing queue depths must be >= 1");
    }
    if config.indexing.pending_grace_secs < 0 {
        bail!("indexing.pending_grace_secs must be >= 0");
    }

    // Retrieval
    if config.retrieval.top_k == 0 || config.retrieval.top_k > localrag_core::retrieve::MAX_K {
        bail!(
            "retrieval.top_k must be in [1, {}]",
            localrag_core::retrieve::MAX_K
        );
    }
    if let Some(min) = config.retrieval.min_similarity {
        if !(-1.0..=1.0).contains(&min) {
            bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
        }
    }
    if config.retrieval.max_context_chars == 0 {
        bail!("retrieval.max_context_chars must be > 0");
    }

    // Generation
    match config.generation.provider.as_str() {
        "none" => {}
        "ollama" => {
            if config.generation.model.is_none() {
                bail!("generation.model must be specified when provider is 'ollama'");
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be none or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "[db]\npath = \"/tmp/kb/meta.sqlite\"\n");
        let config = load_config(&path).unwrap();

        assert_eq!(config.chunking.window, 256);
        assert_eq!(config.chunking.unit, ChunkUnit::Tokens);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.max_attempts, 4);
        assert_eq!(config.scan.mode, ScanMode::Manual);
        assert_eq!(config.scan.on_permission_denied, PermissionPolicy::Skip);
        assert_eq!(config.indexing.workers, 4);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.generation.provider, "none");
        assert_eq!(
            config.db.vector_path(),
            PathBuf::from("/tmp/kb/vectors.sqlite")
        );
    }

    #[test]
    fn parses_enums_and_overrides() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"
[db]
path = "kb.sqlite"
vector_path = "/elsewhere/v.sqlite"

[chunking]
unit = "chars"
window = 800

[scan]
mode = "custom"
paths = ["/a", "/b"]
on_permission_denied = "abort"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.chunking.unit, ChunkUnit::Chars);
        assert_eq!(config.chunking.to_params().window_chars(), 800);
        assert_eq!(config.scan.mode, ScanMode::Custom);
        assert_eq!(config.scan.paths.len(), 2);
        assert_eq!(config.scan.on_permission_denied, PermissionPolicy::Abort);
        assert_eq!(
            config.db.vector_path(),
            PathBuf::from("/elsewhere/v.sqlite")
        );
    }

    #[test]
    fn rejects_out_of_range_overlap() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "[db]\npath = \"kb.sqlite\"\n[chunking]\noverlap_fraction = 0.8\n",
        );
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("overlap_fraction"), "{}", err);
    }

    #[test]
    fn rejects_unknown_providers() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "[db]\npath = \"kb.sqlite\"\n[embedding]\nprovider = \"cloud\"\n",
        );
        assert!(load_config(&path).is_err());

        let path = write(
            &dir,
            "[db]\npath = \"kb.sqlite\"\n[generation]\nprovider = \"ollama\"\n",
        );
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("generation.model"), "{}", err);
    }
}
