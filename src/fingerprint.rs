//! Device and public-key fingerprints.
//!
//! The login service profiles devices through an opaque fingerprint string
//! submitted with each login; a stable random value is enough to keep a
//! device "known" across sessions and skip repeated second-factor checks.
//! Public keys get a digest of their own to index the locally cached
//! correlation cookies.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Generates a fresh device fingerprint: 32 lowercase hex characters.
///
/// Callers persist the value and reuse it; generating a new fingerprint per
/// login makes every login look like a new device.
#[must_use]
pub fn generate() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Digest of a public key, used as the correlation-cache index.
///
/// Whitespace is stripped first so a key hashes identically whether it
/// arrived PEM-wrapped or as one base64 line.
#[must_use]
pub fn hash_public_key(public_key: &str) -> String {
    let cleaned: String = public_key.split_whitespace().collect();
    hex::encode(Sha256::digest(cleaned.as_bytes()))
}
