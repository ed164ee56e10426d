//! Test fixtures and helpers.

use sha2::{Digest, Sha256};

/// Raw admin token matching `AdminConfig::for_testing()`.
#[allow(dead_code)]
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Compute the hex-encoded SHA256 hash of data.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Container blob path for the given content.
#[allow(dead_code)]
pub fn blob_path(image: &str, content: &[u8]) -> String {
    format!("{image}/blobs/sha256:{}", sha256_hash(content))
}
