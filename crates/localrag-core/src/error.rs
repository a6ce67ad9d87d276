//! Error taxonomy.
//!
//! Each failure class is isolated to the smallest unit it affects: a
//! [`LoadError`] or [`ChunkError`] fails one file, an [`EmbeddingError`]
//! fails one document once retries are exhausted, an [`IndexWriteError`]
//! rolls back one document's commit, a [`ScanPermissionError`] is recorded
//! while traversal continues, and a [`QueryError`] is returned to the caller
//! without touching the index.

use std::path::PathBuf;

use thiserror::Error;

/// Text extraction failed for one file.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt {format} content: {message}")]
    Corrupt { format: String, message: String },

    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("unreadable file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    /// Classify an I/O error raised while reading `path`.
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            LoadError::PermissionDenied(path)
        } else {
            LoadError::Unreadable { path, source: err }
        }
    }
}

/// Extracted text could not be segmented.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChunkError {
    #[error("invalid chunking parameters: {0}")]
    InvalidParams(String),

    #[error("extracted text contains binary content")]
    BinaryContent,

    #[error("document produced {produced} chunks, limit is {limit}")]
    TooManyChunks { produced: usize, limit: usize },
}

/// The embedding collaborator failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedder unavailable: {0}")]
    Unavailable(String),

    #[error("embedder rate limited: {0}")]
    RateLimited(String),

    #[error("embedder timed out")]
    Timeout,

    #[error("embedder rejected input: {0}")]
    Rejected(String),

    #[error("embedder returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    #[error("embedder returned dimension {got}, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedder returned a non-finite value in vector {index}")]
    NonFinite { index: usize },

    #[error("embedding failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl EmbeddingError {
    /// Transient failures are worth another attempt; the rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Unavailable(_) | EmbeddingError::RateLimited(_) | EmbeddingError::Timeout
        )
    }
}

/// Committing one document to the metadata store and vector index failed.
#[derive(Error, Debug)]
pub enum IndexWriteError {
    #[error("metadata store write failed: {0}")]
    Metadata(String),

    #[error("vector index write failed: {0}")]
    Vector(String),

    #[error("illegal status transition for {path}: {from} -> {to}")]
    InvalidTransition {
        path: PathBuf,
        from: String,
        to: String,
    },

    #[error("{chunks} chunks but {vectors} vectors supplied")]
    VectorCountMismatch { chunks: usize, vectors: usize },

    #[error("index requires repair before further writes (run `lrag reconcile --repair`)")]
    RepairRequired,
}

/// A directory or file could not be read during traversal.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("permission denied: {path}: {message}")]
pub struct ScanPermissionError {
    pub path: PathBuf,
    pub message: String,
}

/// Malformed query input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("query text is empty")]
    Empty,

    #[error("result count must be between 1 and {max}, got {got}")]
    InvalidLimit { got: usize, max: usize },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

/// The license gate refused an operation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("license check failed: {operation} is not permitted")]
pub struct LicenseDenied {
    pub operation: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_from_io_classifies_permission() {
        let err = LoadError::from_io(
            "/secret/file.md",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, LoadError::PermissionDenied(_)));

        let err = LoadError::from_io(
            "/gone.md",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(matches!(err, LoadError::Unreadable { .. }));
        assert!(err.to_string().contains("/gone.md"));
    }

    #[test]
    fn test_chunk_error_display() {
        let err = ChunkError::TooManyChunks {
            produced: 12,
            limit: 10,
        };
        assert_eq!(err.to_string(), "document produced 12 chunks, limit is 10");
    }

    #[test]
    fn test_embedding_error_retryable() {
        assert!(EmbeddingError::Timeout.is_retryable());
        assert!(EmbeddingError::Unavailable("connection refused".into()).is_retryable());
        assert!(EmbeddingError::RateLimited("429".into()).is_retryable());
        assert!(!EmbeddingError::Rejected("bad input".into()).is_retryable());
        assert!(!EmbeddingError::DimensionMismatch {
            expected: 384,
            got: 768
        }
        .is_retryable());
    }

    #[test]
    fn test_query_error_display() {
        let err = QueryError::InvalidLimit { got: 0, max: 100 };
        assert_eq!(err.to_string(), "result count must be between 1 and 100, got 0");
    }

    #[test]
    fn test_license_denied_display() {
        let err = LicenseDenied {
            operation: "indexing",
        };
        assert_eq!(
            err.to_string(),
            "license check failed: indexing is not permitted"
        );
    }
}
