//! Common helper functions.

use sha2::{Digest, Sha256};

/// Short, non-reversible identifier for a symmetric key.
///
/// Used in logs so keypairs can be correlated across install/retire events
/// without ever printing key material.
pub fn key_fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..4])
}

/// Parse a boolean environment value (`1`, `true`, `yes`, `on`).
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
