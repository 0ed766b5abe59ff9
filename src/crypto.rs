//! RSA encryption of submitted credentials.
//!
//! The login service hands out an RSA public key and expects the password
//! (and, during second-factor verification, the SMS code) encrypted with
//! PKCS#1 v1.5 padding and base64-encoded. Keys arrive in whatever shape
//! the backend is in the mood for: standard or URL-safe base64, with or
//! without a PEM envelope. [`encrypt`] normalizes all of them to SPKI DER
//! before use.
//!
//! Every failure collapses into the opaque [`EncryptError`]; callers
//! restart the key exchange instead of branching on a cause, and the cause
//! itself is only logged.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurposeConfig, STANDARD};
use base64::engine::{DecodePaddingMode, GeneralPurpose};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use thiserror::Error;
use tracing::debug;

/// PKCS#1 v1.5 padding consumes 11 bytes of the modulus.
const PKCS1_PADDING_OVERHEAD: usize = 11;

/// PEM armor lines stripped during key normalization.
const PEM_MARKERS: [&str; 4] = [
    "-----BEGIN PUBLIC KEY-----",
    "-----END PUBLIC KEY-----",
    "-----BEGIN RSA PUBLIC KEY-----",
    "-----END RSA PUBLIC KEY-----",
];

/// Decoder tolerating both padded and unpadded base64 key bodies.
const RELAXED_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Opaque credential-encryption failure.
///
/// Malformed keys, oversized plaintexts, and cipher failures are
/// indistinguishable on purpose; the remedy is always a fresh key exchange.
#[derive(Debug, Error)]
#[error("credential encryption failed")]
pub struct EncryptError(());

/// Encrypts `plaintext` under the server-issued public key.
///
/// Returns the PKCS#1 v1.5 ciphertext as standard base64. The key may be
/// standard or URL-safe base64 SPKI, optionally wrapped in a PEM envelope.
///
/// # Errors
///
/// Returns [`EncryptError`] when the key does not normalize to a usable
/// RSA public key, the plaintext exceeds the modulus capacity, or the
/// cipher operation itself fails.
pub fn encrypt(plaintext: &str, public_key: &str) -> Result<String, EncryptError> {
    let der = normalize_key_der(public_key)?;
    let key = RsaPublicKey::from_public_key_der(&der).map_err(|error| {
        debug!(%error, "public key rejected as SPKI DER");
        EncryptError(())
    })?;

    let capacity = key.size().saturating_sub(PKCS1_PADDING_OVERHEAD);
    if plaintext.len() > capacity {
        debug!(
            plaintext_len = plaintext.len(),
            capacity, "plaintext exceeds PKCS#1 v1.5 capacity"
        );
        return Err(EncryptError(()));
    }

    let mut rng = rand::thread_rng();
    let ciphertext = key
        .encrypt(&mut rng, Pkcs1v15Encrypt, plaintext.as_bytes())
        .map_err(|error| {
            debug!(%error, "RSA encryption failed");
            EncryptError(())
        })?;

    Ok(STANDARD.encode(ciphertext))
}

/// Reduces a server-issued key to SPKI DER bytes.
///
/// Strips PEM armor and whitespace, maps the URL-safe alphabet back to the
/// standard one, and decodes ignoring padding.
fn normalize_key_der(raw: &str) -> Result<Vec<u8>, EncryptError> {
    let mut body = raw.to_string();
    for marker in PEM_MARKERS {
        body = body.replace(marker, "");
    }
    body.retain(|c| !c.is_whitespace());

    let body: String = body
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    if body.is_empty() {
        debug!("public key is empty after normalization");
        return Err(EncryptError(()));
    }

    RELAXED_STANDARD
        .decode(body.trim_end_matches('='))
        .map_err(|error| {
            debug!(%error, "public key is not valid base64");
            EncryptError(())
        })
}
