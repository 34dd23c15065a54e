// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ed25519 keypairs, detached signatures, and the verifier trust file.
//!
//! Keys travel as PEM: PKCS#8 for private halves (never written to any
//! artifact) and SPKI for public halves. A key id is derived from the public
//! PEM so that verifiers can name keys without carrying the PEM everywhere:
//! `ed25519:` + the first 32 hex chars of SHA-256 over the PEM bytes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Role-based trust file for offline verification.
pub mod trust;

use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use settld_canon::{b64_decode, b64_encode, sha256_hex};
use sha2::Sha256;

pub use trust::{TrustRole, TrustStore, TrustedKey};

/// Prefix carried by every Ed25519 key id.
pub const KEY_ID_PREFIX: &str = "ed25519:";

/// Errors from key handling and signing.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A PEM blob failed to parse as the expected key type.
    #[error("invalid {kind} PEM: {reason}")]
    InvalidPem {
        /// `"public"` or `"private"`.
        kind: &'static str,
        /// Parser detail.
        reason: String,
    },

    /// PEM encoding failed.
    #[error("failed to encode PEM: {0}")]
    PemEncode(String),
}

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// An Ed25519 keypair with PEM renderings and a derived key id.
pub struct Keypair {
    signing: SigningKey,
    public_pem: String,
    key_id: String,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::PemEncode`] if PEM rendering fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    /// Rebuild a keypair from a PKCS#8 private key PEM.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPem`] on parse failure.
    pub fn from_private_key_pem(pem: &str) -> Result<Self, CryptoError> {
        let signing = SigningKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::InvalidPem {
            kind: "private",
            reason: e.to_string(),
        })?;
        Self::from_signing_key(signing)
    }

    fn from_signing_key(signing: SigningKey) -> Result<Self, CryptoError> {
        let public_pem = encode_public_key_pem(&signing.verifying_key())?;
        let key_id = key_id_for_public_pem(&public_pem);
        Ok(Self {
            signing,
            public_pem,
            key_id,
        })
    }

    /// The SPKI public key PEM.
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// The PKCS#8 private key PEM. Handle with care; never persisted in
    /// artifacts.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::PemEncode`] if PEM rendering fails.
    pub fn private_key_pem(&self) -> Result<String, CryptoError> {
        self.signing
            .to_pkcs8_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
            .map(|z| z.to_string())
            .map_err(|e| CryptoError::PemEncode(e.to_string()))
    }

    /// The derived `ed25519:<hex32>` key id.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign `bytes`, returning a detached base64 signature.
    #[must_use]
    pub fn sign(&self, bytes: &[u8]) -> String {
        sign_detached(bytes, &self.signing)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The private half never appears in debug output.
        f.debug_struct("Keypair")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Render a verifying key as SPKI PEM.
///
/// # Errors
///
/// Returns [`CryptoError::PemEncode`] if PEM rendering fails.
pub fn encode_public_key_pem(key: &VerifyingKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
        .map_err(|e| CryptoError::PemEncode(e.to_string()))
}

/// Parse an SPKI public key PEM.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPem`] on parse failure.
pub fn decode_public_key_pem(pem: &str) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidPem {
        kind: "public",
        reason: e.to_string(),
    })
}

/// Derive the key id for a public key PEM:
/// `ed25519:` + first 32 hex chars of `sha256(pem)`.
#[must_use]
pub fn key_id_for_public_pem(pem: &str) -> String {
    let digest = sha256_hex(pem.as_bytes());
    format!("{KEY_ID_PREFIX}{}", &digest[..32])
}

/// Sign `bytes` with a detached Ed25519 signature, base64-encoded.
#[must_use]
pub fn sign_detached(bytes: &[u8], key: &SigningKey) -> String {
    let sig: Signature = key.sign(bytes);
    b64_encode(&sig.to_bytes())
}

/// Verify a detached base64 Ed25519 signature.
///
/// Malformed base64 or signature bytes yield `false`, never a panic.
#[must_use]
pub fn verify_detached(bytes: &[u8], signature_b64: &str, key: &VerifyingKey) -> bool {
    let Some(raw) = b64_decode(signature_b64) else {
        return false;
    };
    let Ok(raw64) = <[u8; 64]>::try_from(raw.as_slice()) else {
        return false;
    };
    let sig = Signature::from_bytes(&raw64);
    key.verify(bytes, &sig).is_ok()
}

/// Verify a detached signature against a public key PEM.
///
/// Any PEM, base64, or signature failure yields `false`.
#[must_use]
pub fn verify_detached_pem(bytes: &[u8], signature_b64: &str, public_key_pem: &str) -> bool {
    match decode_public_key_pem(public_key_pem) {
        Ok(key) => verify_detached(bytes, signature_b64, &key),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Webhook HMAC
// ---------------------------------------------------------------------------

/// Compute the delivery webhook signature: lowercase hex
/// HMAC-SHA256 over the canonical body bytes.
#[must_use]
pub fn webhook_signature(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-shape check of a webhook signature header against the body.
#[must_use]
pub fn webhook_signature_matches(secret: &[u8], body: &[u8], header: &str) -> bool {
    // Recompute-and-compare; signatures are hex so a simple eq is fine here.
    webhook_signature(secret, body) == header.to_ascii_lowercase()
}
