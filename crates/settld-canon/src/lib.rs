// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON and content hashing.
//!
//! Every hash in the settlement substrate flows through this crate: values are
//! normalized recursively, emitted as compact JSON with byte-wise sorted keys,
//! and digested with SHA-256. Two values that normalize identically always
//! hash identically, on every platform.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Typed identifier prefixes and validation.
pub mod ids;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Length of a lowercase hex SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from canonicalization and hashing.
#[derive(Debug, thiserror::Error)]
pub enum CanonError {
    /// A value cannot be represented in canonical JSON (non-finite number,
    /// or a type serde cannot express as JSON).
    #[error("CANONICAL_JSON_UNSUPPORTED_VALUE: {reason}")]
    UnsupportedValue {
        /// What made the value unrepresentable.
        reason: String,
    },

    /// JSON serialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Recursively normalize a JSON value into its canonical shape.
///
/// Objects are rebuilt with every member normalized (serde_json's map is
/// key-sorted, which gives byte-wise lexicographic ordering on emit), arrays
/// keep their source order, and explicit `null`s are preserved. Nothing is
/// dropped.
///
/// # Errors
///
/// Returns [`CanonError::UnsupportedValue`] for non-finite numbers.
pub fn normalize(value: &Value) -> Result<Value, CanonError> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(value.clone()),
        Value::Number(n) => {
            if let Some(f) = n.as_f64()
                && !f.is_finite()
            {
                return Err(CanonError::UnsupportedValue {
                    reason: format!("non-finite number {f}"),
                });
            }
            Ok(Value::Number(n.clone()))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(normalize(item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(members) => {
            let mut out = Map::new();
            for (k, v) in members {
                out.insert(k.clone(), normalize(v)?);
            }
            Ok(Value::Object(out))
        }
    }
}

/// Produce the canonical UTF-8 bytes for a JSON value.
///
/// Compact form: no whitespace between tokens, keys sorted byte-wise,
/// integers verbatim, minimal string escaping.
///
/// # Errors
///
/// Returns [`CanonError`] if the value cannot be normalized or serialized.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonError> {
    let normalized = normalize(value)?;
    Ok(serde_json::to_vec(&normalized)?)
}

/// Canonicalize any serializable value to a compact JSON string.
///
/// # Errors
///
/// Returns [`CanonError`] if the value cannot be converted to JSON.
pub fn canonical_string<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let v = serde_json::to_value(value)?;
    let normalized = normalize(&v)?;
    Ok(serde_json::to_string(&normalized)?)
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Compute the lowercase hex SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash any serializable value through the canonical pipeline.
///
/// Everywhere the substrate says "hash", it means this:
/// `sha256_hex(canonical_bytes(value))`.
///
/// # Errors
///
/// Returns [`CanonError`] if the value cannot be canonicalized.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let s = canonical_string(value)?;
    Ok(sha256_hex(s.as_bytes()))
}

/// Returns `true` if `s` is a well-formed lowercase hex SHA-256 digest.
#[must_use]
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

// ---------------------------------------------------------------------------
// Base64 helpers
// ---------------------------------------------------------------------------

/// Encode bytes as standard base64 (used for signatures and small blobs).
#[must_use]
pub fn b64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode standard base64, returning `None` on malformed input.
#[must_use]
pub fn b64_decode(s: &str) -> Option<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

// ---------------------------------------------------------------------------
// Schema versions
// ---------------------------------------------------------------------------

/// Render a schema version constant of the form `<Name>.v<int>`.
#[must_use]
pub fn schema_version(name: &str, v: u32) -> String {
    format!("{name}.v{v}")
}

/// Split a `<Name>.v<int>` schema version string into its parts.
#[must_use]
pub fn parse_schema_version(s: &str) -> Option<(&str, u32)> {
    let (name, tail) = s.rsplit_once(".v")?;
    if name.is_empty() {
        return None;
    }
    let v = tail.parse().ok()?;
    Some((name, v))
}
