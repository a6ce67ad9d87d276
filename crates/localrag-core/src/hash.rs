//! Content hashing.
//!
//! File hashes drive the scan fast path, chunk text hashes key the
//! embedding cache, and chunk identifiers are derived from both.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Stable chunk identifier for (document, sequence index, chunk text hash).
pub fn chunk_id(document_id: &str, seq: u32, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(seq.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn chunk_id_depends_on_every_component() {
        let base = chunk_id("/a.md", 0, "h1");
        assert_eq!(base, chunk_id("/a.md", 0, "h1"));
        assert_ne!(base, chunk_id("/b.md", 0, "h1"));
        assert_ne!(base, chunk_id("/a.md", 1, "h1"));
        assert_ne!(base, chunk_id("/a.md", 0, "h2"));
    }
}
