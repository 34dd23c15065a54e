// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bundle manifests.
//!
//! A bundle ZIP contains `manifest.json` plus the files it references. Each
//! referenced file carries a declared role and sha256; verification checks
//! that every declared file is present with matching bytes and that paths
//! match their declared roles.

use serde::{Deserialize, Serialize};
use settld_artifact::Report;
use settld_canon::sha256_hex;
use settld_error::ErrorCode;

use crate::{safe_unzip, write_deterministic_zip, UnzipBudget, ZipError};

/// Manifest entry path inside every bundle.
pub const MANIFEST_PATH: &str = "manifest.json";

/// One declared file in a bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    /// Entry path inside the archive.
    pub path: String,
    /// Declared role (`"report"`, `"evidence"`, `"transcript"`, …).
    pub role: String,
    /// sha256 of the file bytes.
    pub sha256: String,
}

/// The bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    /// Always `"BundleManifest.v1"`.
    pub schema_version: String,
    /// Declared files, in path order.
    pub files: Vec<ManifestFile>,
}

impl BundleManifest {
    /// The exact schema version string.
    pub const SCHEMA_VERSION: &'static str = "BundleManifest.v1";
}

/// Role-to-path convention: a file's path must live under its role directory,
/// except the single top-level report.
fn path_matches_role(path: &str, role: &str) -> bool {
    match role {
        "report" => !path.contains('/'),
        _ => path.starts_with(&format!("{role}/")),
    }
}

/// Assemble a deterministic bundle from `(path, role, bytes)` triples.
///
/// The manifest is generated, serialized canonically, and stored at
/// [`MANIFEST_PATH`].
///
/// # Errors
///
/// Returns [`ZipError`] for unsafe paths or a path colliding with the
/// manifest.
pub fn build_bundle(files: &[(String, String, Vec<u8>)]) -> Result<Vec<u8>, ZipError> {
    let mut declared: Vec<ManifestFile> = files
        .iter()
        .map(|(path, role, bytes)| ManifestFile {
            path: path.clone(),
            role: role.clone(),
            sha256: sha256_hex(bytes),
        })
        .collect();
    declared.sort_by(|a, b| a.path.cmp(&b.path));

    let manifest = BundleManifest {
        schema_version: BundleManifest::SCHEMA_VERSION.to_string(),
        files: declared,
    };
    let manifest_bytes = settld_canon::canonical_string(&manifest)
        .map_err(|_| ZipError::Malformed {
            reason: "manifest serialization failed",
        })?
        .into_bytes();

    let mut entries: Vec<(String, Vec<u8>)> = files
        .iter()
        .map(|(path, _, bytes)| (path.clone(), bytes.clone()))
        .collect();
    entries.push((MANIFEST_PATH.to_string(), manifest_bytes));
    write_deterministic_zip(&entries)
}

/// Verify a bundle's structure against its manifest.
///
/// Checks, fail-closed: archive safety and budgets, manifest presence and
/// schema version, per-file sha256, role/path agreement, and that no
/// undeclared files ride along.
#[must_use]
pub fn verify_bundle(bytes: &[u8], budget: &UnzipBudget) -> Report {
    let mut report = Report::new();
    let entries = match safe_unzip(bytes, budget) {
        Ok(entries) => entries,
        Err(e) => {
            report.error(e.code(), "", e.to_string());
            return report;
        }
    };

    let Some(manifest_bytes) = entries
        .iter()
        .find(|(p, _)| p == MANIFEST_PATH)
        .map(|(_, b)| b)
    else {
        report.error_code(ErrorCode::SchemaInvalid, MANIFEST_PATH, "missing manifest.json");
        return report;
    };
    let manifest: BundleManifest = match serde_json::from_slice(manifest_bytes) {
        Ok(m) => m,
        Err(e) => {
            report.error_code(ErrorCode::SchemaInvalid, MANIFEST_PATH, e.to_string());
            return report;
        }
    };
    if manifest.schema_version != BundleManifest::SCHEMA_VERSION {
        report.error_code(
            ErrorCode::UnsupportedSchemaVersion,
            "manifest.schemaVersion",
            format!(
                "expected {:?}, got {:?}",
                BundleManifest::SCHEMA_VERSION,
                manifest.schema_version
            ),
        );
        return report;
    }

    for file in &manifest.files {
        let path = &file.path;
        match entries.iter().find(|(p, _)| p == path) {
            None => {
                report.error_code(
                    ErrorCode::SchemaInvalid,
                    path.clone(),
                    "declared in manifest but missing from archive",
                );
            }
            Some((_, bytes)) => {
                let actual = sha256_hex(bytes);
                if actual != file.sha256 {
                    report.error_code(
                        ErrorCode::ArtifactHashMismatch,
                        path.clone(),
                        format!("declared {} != actual {actual}", file.sha256),
                    );
                }
            }
        }
        if !path_matches_role(path, &file.role) {
            report.error_code(
                ErrorCode::SchemaInvalid,
                path.clone(),
                format!("path does not match declared role {:?}", file.role),
            );
        }
    }

    for (path, _) in &entries {
        if path != MANIFEST_PATH && !manifest.files.iter().any(|f| &f.path == path) {
            report.error_code(
                ErrorCode::SchemaInvalid,
                path.clone(),
                "present in archive but not declared in manifest",
            );
        }
    }

    report
}
