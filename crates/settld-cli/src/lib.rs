// SPDX-License-Identifier: MIT OR Apache-2.0
//! Verification plumbing shared by the CLI binary and its tests.
//!
//! The verifier is offline by construction: it reads the target and an
//! optional trust file from disk and recomputes everything locally.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde_json::{json, Value};
use std::path::Path;

use settld_artifact::Report;
use settld_bundle::UnzipBudget;
use settld_crypto::TrustStore;

/// Exit code for a clean pass.
pub const EXIT_OK: i32 = 0;
/// Exit code for a verification failure.
pub const EXIT_VERIFY_FAILED: i32 = 1;
/// Exit code for usage and I/O errors.
pub const EXIT_USAGE: i32 = 2;

/// What kind of target was verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A deterministic ZIP bundle.
    Bundle,
    /// A sealed JSON artifact.
    Artifact,
}

impl TargetKind {
    /// Wire tag for the JSON output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bundle => "bundle",
            Self::Artifact => "artifact",
        }
    }
}

/// Outcome of a verification: the report plus target metadata.
#[derive(Debug)]
pub struct VerifyOutcome {
    /// Target kind.
    pub kind: TargetKind,
    /// The verification report.
    pub report: Report,
}

impl VerifyOutcome {
    /// The process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.report.ok {
            EXIT_OK
        } else {
            EXIT_VERIFY_FAILED
        }
    }

    /// Render the `VerifyCliOutput.v1` JSON document.
    #[must_use]
    pub fn to_cli_output(&self, path: &Path) -> Value {
        json!({
            "schemaVersion": "VerifyCliOutput.v1",
            "ok": self.report.ok,
            "verificationOk": self.report.ok,
            "errors": self.report.errors,
            "warnings": self.report.warnings,
            "target": {
                "kind": self.kind.as_str(),
                "path": path.display().to_string(),
            },
        })
    }
}

/// Verify a target file: a `.zip` bundle or a sealed JSON artifact.
///
/// JSON artifacts are routed by their `schemaVersion` name; an unknown name
/// fails closed.
///
/// # Errors
///
/// Returns an I/O or parse error message for exit-code-2 conditions; every
/// verification failure is inside the returned [`VerifyOutcome`].
pub fn verify_path(path: &Path, trust: Option<&TrustStore>) -> Result<VerifyOutcome, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "zip") {
        return Ok(VerifyOutcome {
            kind: TargetKind::Bundle,
            report: settld_bundle::verify_bundle(&bytes, &UnzipBudget::default()),
        });
    }

    let doc: Value = serde_json::from_slice(&bytes)
        .map_err(|e| format!("{} is not JSON: {e}", path.display()))?;
    let schema = doc
        .get("schemaVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{} has no schemaVersion", path.display()))?;
    let (name, _) = settld_canon::parse_schema_version(schema)
        .ok_or_else(|| format!("malformed schemaVersion {schema:?}"))?;

    let report = match name {
        "SessionReplayPack" => settld_session::verify_replay_pack(&doc, trust),
        "X402SettlementReceipt" => settld_gate::verify_settlement_receipt(&doc),
        "WorkOrderMeteringSnapshot" => settld_workorder::verify_metering_snapshot(&doc),
        "CompletionReceipt" => settld_workorder::verify_completion_receipt(&doc, None),
        "InvoiceBundle" => settld_artifact::families::verify_invoice_bundle(&doc),
        "FinancePack" => settld_artifact::families::verify_finance_pack(&doc),
        "CloseReport" => settld_artifact::families::verify_close_report(&doc),
        "JobProofBundle" => settld_artifact::families::verify_job_proof_bundle(&doc),
        "ProtocolCompatibilityMatrixReport" => {
            settld_artifact::families::verify_compat_matrix_report(&doc)
        }
        other => {
            let mut report = Report::new();
            report.error(
                settld_error::ErrorCode::UnsupportedSchemaVersion.as_str(),
                "schemaVersion",
                format!("no verifier for artifact family {other:?}"),
            );
            report
        }
    };
    Ok(VerifyOutcome {
        kind: TargetKind::Artifact,
        report,
    })
}

/// Load a trust file (the serialized [`settld_crypto::trust::TrustFile`]
/// JSON) from disk.
///
/// # Errors
///
/// Returns an error message for exit-code-2 conditions.
pub fn load_trust(path: &Path) -> Result<TrustStore, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read trust file {}: {e}", path.display()))?;
    TrustStore::from_json(&text).map_err(|e| format!("trust file invalid: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_extension_routes_to_bundle_verifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        let bytes = settld_bundle::build_bundle(&[(
            "report.json".to_string(),
            "report".to_string(),
            b"{}".to_vec(),
        )])
        .unwrap();
        std::fs::write(&path, bytes).unwrap();
        let outcome = verify_path(&path, None).unwrap();
        assert_eq!(outcome.kind, TargetKind::Bundle);
        assert_eq!(outcome.exit_code(), EXIT_OK);
    }

    #[test]
    fn unknown_schema_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thing.json");
        std::fs::write(&path, br#"{"schemaVersion": "Mystery.v1"}"#).unwrap();
        let outcome = verify_path(&path, None).unwrap();
        assert_eq!(outcome.exit_code(), EXIT_VERIFY_FAILED);
        assert_eq!(
            outcome.report.error_codes(),
            vec!["UNSUPPORTED_SCHEMA_VERSION"]
        );
    }

    #[test]
    fn missing_file_is_usage_error() {
        assert!(verify_path(Path::new("/nonexistent/x.json"), None).is_err());
    }

    #[test]
    fn cli_output_shape() {
        let outcome = VerifyOutcome {
            kind: TargetKind::Artifact,
            report: Report::new(),
        };
        let out = outcome.to_cli_output(Path::new("a.json"));
        assert_eq!(out["schemaVersion"], "VerifyCliOutput.v1");
        assert_eq!(out["ok"], true);
        assert_eq!(out["target"]["kind"], "artifact");
    }
}
