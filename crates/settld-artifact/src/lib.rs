// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hash-sealed artifacts.
//!
//! Every artifact is a JSON object with two layers: a hashed inner
//! `<name>Core.vN` object and an outer wrapper carrying `schemaVersion`,
//! `generatedAt`, and `<name>Hash = sha256(canonical(core))`. Builders are
//! pure functions over their inputs; verifiers recompute everything
//! byte-for-byte and never panic — each failed check becomes an entry in a
//! [`Report`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Typed artifact families (close packs, proofs, invoices, finance packs).
pub mod families;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use settld_canon::{canonical_hash, schema_version, CanonError};
use settld_error::ErrorCode;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// One failed or advisory check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckIssue {
    /// Stable error-code string.
    pub code: String,
    /// JSON-pointer-ish location of the failing value.
    pub path: String,
    /// Human-readable detail.
    pub message: String,
}

/// Outcome of a verification pass. `ok` is true iff `errors` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Overall pass flag.
    pub ok: bool,
    /// Failed checks.
    pub errors: Vec<CheckIssue>,
    /// Advisory findings.
    pub warnings: Vec<CheckIssue>,
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl Report {
    /// An empty, passing report.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ok: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    /// Record a failed check.
    pub fn error(&mut self, code: impl Into<String>, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(CheckIssue {
            code: code.into(),
            path: path.into(),
            message: message.into(),
        });
        self.ok = false;
    }

    /// Record a failed check with a taxonomy code.
    pub fn error_code(&mut self, code: ErrorCode, path: impl Into<String>, message: impl Into<String>) {
        self.error(code.as_str(), path, message);
    }

    /// Record an advisory finding.
    pub fn warning(&mut self, code: impl Into<String>, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(CheckIssue {
            code: code.into(),
            path: path.into(),
            message: message.into(),
        });
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: Report) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.ok = self.errors.is_empty();
    }

    /// All error codes, in order.
    #[must_use]
    pub fn error_codes(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.code.clone()).collect()
    }

    /// All warning codes, in order.
    #[must_use]
    pub fn warning_codes(&self) -> Vec<String> {
        self.warnings.iter().map(|w| w.code.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Sealing
// ---------------------------------------------------------------------------

/// Wire shape of one artifact family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactSpec {
    /// Schema name (`"InvoiceBundle"`).
    pub name: &'static str,
    /// Schema version integer.
    pub version: u32,
    /// Wrapper member holding the core hash (`"invoiceHash"`).
    pub hash_field: &'static str,
    /// Wrapper member holding the core object (`"invoiceCore"`).
    pub core_field: &'static str,
}

impl ArtifactSpec {
    /// The exact `schemaVersion` string this family requires.
    #[must_use]
    pub fn schema_version(&self) -> String {
        schema_version(self.name, self.version)
    }
}

/// Seal a core into its wrapper: compute the core hash and assemble
/// `{schemaVersion, generatedAt, <name>Hash, <name>Core}`.
///
/// # Errors
///
/// Returns [`CanonError`] if the core cannot be canonicalized.
pub fn seal(spec: &ArtifactSpec, core: &Value, generated_at: &str) -> Result<Value, CanonError> {
    let hash = canonical_hash(core)?;
    let mut out = serde_json::Map::new();
    out.insert("schemaVersion".into(), Value::String(spec.schema_version()));
    out.insert("generatedAt".into(), Value::String(generated_at.to_string()));
    out.insert(spec.hash_field.into(), Value::String(hash));
    out.insert(spec.core_field.into(), core.clone());
    Ok(Value::Object(out))
}

/// Verify a wrapper: exact schema version, core presence, and a
/// byte-for-byte hash recompute. Returns the core on success so callers can
/// run family-specific checks without re-extracting it.
pub fn verify_seal<'a>(spec: &ArtifactSpec, artifact: &'a Value, report: &mut Report) -> Option<&'a Value> {
    let Some(obj) = artifact.as_object() else {
        report.error_code(ErrorCode::SchemaInvalid, "", "artifact is not a JSON object");
        return None;
    };

    let expected_version = spec.schema_version();
    match obj.get("schemaVersion").and_then(Value::as_str) {
        Some(actual) if actual == expected_version => {}
        Some(actual) => {
            report.error_code(
                ErrorCode::UnsupportedSchemaVersion,
                "schemaVersion",
                format!("expected {expected_version:?}, got {actual:?}"),
            );
            return None;
        }
        None => {
            report.error_code(ErrorCode::SchemaInvalid, "schemaVersion", "missing schemaVersion");
            return None;
        }
    }

    if obj.get("generatedAt").and_then(Value::as_str).is_none() {
        report.error_code(ErrorCode::SchemaInvalid, "generatedAt", "missing generatedAt");
    }

    let Some(core) = obj.get(spec.core_field) else {
        report.error_code(
            ErrorCode::SchemaInvalid,
            spec.core_field,
            format!("missing {}", spec.core_field),
        );
        return None;
    };
    let Some(stored_hash) = obj.get(spec.hash_field).and_then(Value::as_str) else {
        report.error_code(
            ErrorCode::SchemaInvalid,
            spec.hash_field,
            format!("missing {}", spec.hash_field),
        );
        return None;
    };

    match canonical_hash(core) {
        Ok(recomputed) if recomputed == stored_hash => Some(core),
        Ok(recomputed) => {
            report.error_code(
                ErrorCode::ArtifactHashMismatch,
                spec.hash_field,
                format!("stored {stored_hash} != recomputed {recomputed}"),
            );
            None
        }
        Err(e) => {
            report.error_code(ErrorCode::SchemaInvalid, spec.core_field, e.to_string());
            None
        }
    }
}

/// Check that a hash recorded in one artifact matches another artifact's
/// recomputed core hash (one-way hash binding between artifacts).
pub fn verify_cross_binding(
    declared_hash: &str,
    bound_core: &Value,
    path: &str,
    report: &mut Report,
) {
    match canonical_hash(bound_core) {
        Ok(actual) if actual == declared_hash => {}
        Ok(actual) => {
            report.error_code(
                ErrorCode::CrossArtifactBindingMismatch,
                path,
                format!("declared {declared_hash} != bound core hash {actual}"),
            );
        }
        Err(e) => {
            report.error_code(ErrorCode::SchemaInvalid, path, e.to_string());
        }
    }
}
