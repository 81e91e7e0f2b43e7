//! Content-addressed integrity verification.
//!
//! Cached artifacts are recorded with SHA-256 digests when they enter the
//! cache; any later mismatch means the cache was tampered with and is fatal.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A content hash (SHA-256 hex digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Compute the SHA-256 hash of the given data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = hasher.finalize();
        ContentHash(hex_encode(&digest))
    }

    /// Get the hex string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify that the given data matches this hash.
    pub fn verify(&self, data: &[u8]) -> bool {
        ContentHash::compute(data) == *self
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encode bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hashes recorded for one cached module version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityRecord {
    /// SHA-256 of the manifest bytes, once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<ContentHash>,
    /// SHA-256 of the archive bytes, once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_hash: Option<ContentHash>,
}
