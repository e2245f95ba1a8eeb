//! Credential fingerprints and display helpers.
//!
//! A fingerprint is the only identifier a credential is known by outside of
//! memory. It is a SHA-256 digest and cannot be reversed into the secret.

use sha2::{Digest, Sha256};

const FINGERPRINT_PREFIX: &str = "sha256:";
const DEFAULT_DISPLAY_LEN: usize = 16;

/// Compute the fingerprint of a raw secret (`sha256:<hex>`).
pub fn fingerprint(secret: &str) -> String {
    format!(
        "{}{}",
        FINGERPRINT_PREFIX,
        hex::encode(Sha256::digest(secret.as_bytes()))
    )
}

/// Shorten a fingerprint for logs and tables.
pub fn short_fingerprint(fingerprint: &str) -> String {
    truncate(fingerprint, DEFAULT_DISPLAY_LEN)
}

/// Truncate a fingerprint to `len` characters, appending `...` when cut.
pub fn truncate(fingerprint: &str, len: usize) -> String {
    if fingerprint.chars().count() <= len {
        return fingerprint.to_string();
    }
    let head: String = fingerprint.chars().take(len).collect();
    format!("{}...", head)
}
