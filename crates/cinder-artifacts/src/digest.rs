//! Content digests for artifact blobs.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_LEN: usize = 64;

/// Lowercase hex SHA-256 of `data`.
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Check that `digest` looks like something [`content_digest`] produced.
/// Guards filesystem paths built from digests.
pub fn is_valid_digest(digest: &str) -> bool {
    digest.len() == DIGEST_LEN
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Two-character fan-out directory for a digest.
pub fn shard(digest: &str) -> &str {
    &digest[..2.min(digest.len())]
}
