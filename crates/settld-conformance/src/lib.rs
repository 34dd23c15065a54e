// SPDX-License-Identifier: MIT OR Apache-2.0
//! Conformance harness.
//!
//! A conformance pack is a versioned folder with a `cases.json` and fixture
//! files. Each case copies its fixture to a temp dir, applies mutations,
//! runs the matching verifier, and diffs the observed outcome against the
//! expectation. The run emits a `ConformanceRunReport.v1` and a hash-bound
//! `ConformanceCertBundle.v1`; strict-artifact mode cross-validates the pair
//! byte-for-byte and rejects any drift.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Mutation operators applied to staged fixtures.
pub mod mutate;
/// Case execution.
pub mod runner;

use serde_json::{json, Value};
use settld_artifact::{seal, verify_seal, ArtifactSpec, Report};
use settld_canon::canonical_string;
use settld_error::ErrorCode;

pub use mutate::Mutation;
pub use runner::{run_pack, Case, CaseKind, CaseOutcome, CaseResult, Expected, RunOptions};

/// `ConformanceRunReport.v1` wire shape.
pub const RUN_REPORT: ArtifactSpec = ArtifactSpec {
    name: "ConformanceRunReport",
    version: 1,
    hash_field: "reportHash",
    core_field: "reportCore",
};

/// `ConformanceCertBundle.v1` wire shape.
pub const CERT_BUNDLE: ArtifactSpec = ArtifactSpec {
    name: "ConformanceCertBundle",
    version: 1,
    hash_field: "certHash",
    core_field: "certCore",
};

/// Tool version stamped into cert bundles.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the sealed run report for a finished run.
///
/// # Errors
///
/// Returns [`settld_canon::CanonError`] on canonicalization failure.
pub fn build_run_report(
    run_id: &str,
    results: &[CaseResult],
    started_at: &str,
    finished_at: &str,
) -> Result<Value, settld_canon::CanonError> {
    let passed = results.iter().filter(|r| r.pass).count();
    let core = json!({
        "runId": run_id,
        "startedAt": started_at,
        "finishedAt": finished_at,
        "caseCount": results.len(),
        "passedCount": passed,
        "failedCount": results.len() - passed,
        "cases": results,
    });
    seal(&RUN_REPORT, &core, finished_at)
}

/// Build the cert bundle bound to a run report.
///
/// The cert embeds the report core verbatim plus its hash — the one-way
/// binding that replaces any runtime back-pointer between the pair.
///
/// # Errors
///
/// Returns [`settld_canon::CanonError`] on canonicalization failure.
pub fn build_cert_bundle(
    report: &Value,
    issued_at: &str,
) -> Result<Value, settld_canon::CanonError> {
    let report_core = report
        .get(RUN_REPORT.core_field)
        .cloned()
        .unwrap_or(Value::Null);
    let core = json!({
        "reportCore": report_core,
        "reportHash": settld_canon::canonical_hash(&report_core)?,
        "toolVersion": TOOL_VERSION,
        "issuedAt": issued_at,
    });
    seal(&CERT_BUNDLE, &core, issued_at)
}

/// Strict-artifact cross-validation of a report/cert pair.
///
/// Recomputes both seals, then requires the cert's embedded `reportCore` to
/// canonicalize to exactly the same bytes as the standalone report's core,
/// and the cert's `reportHash` to match. Any drift is
/// `CONFORMANCE_STRICT_ARTIFACT_VALIDATION_FAILED`.
#[must_use]
pub fn validate_strict_artifacts(report: &Value, cert: &Value) -> Report {
    let mut out = Report::new();
    let report_core = verify_seal(&RUN_REPORT, report, &mut out);
    let cert_core = verify_seal(&CERT_BUNDLE, cert, &mut out);
    let (Some(report_core), Some(cert_core)) = (report_core, cert_core) else {
        // Seal failures in strict mode escalate to the strict code as well.
        out.error_code(
            ErrorCode::ConformanceStrictArtifactValidationFailed,
            "",
            "seal validation failed under --strict-artifacts",
        );
        return out;
    };

    let standalone = canonical_string(report_core).unwrap_or_default();
    let embedded = cert_core
        .get("reportCore")
        .map(|c| canonical_string(c).unwrap_or_default())
        .unwrap_or_default();
    if standalone != embedded {
        out.error_code(
            ErrorCode::ConformanceStrictArtifactValidationFailed,
            "certCore.reportCore",
            "embedded report core does not canonicalize to the standalone report core",
        );
    }

    let declared_hash = cert_core
        .get("reportHash")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match settld_canon::canonical_hash(report_core) {
        Ok(actual) if actual == declared_hash => {}
        Ok(actual) => out.error_code(
            ErrorCode::ConformanceStrictArtifactValidationFailed,
            "certCore.reportHash",
            format!("declared {declared_hash} != recomputed {actual}"),
        ),
        Err(e) => out.error_code(
            ErrorCode::ConformanceStrictArtifactValidationFailed,
            "reportCore",
            e.to_string(),
        ),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CaseOutcome;

    const AT: &str = "2026-02-02T00:00:00.000Z";

    fn sample_results() -> Vec<CaseResult> {
        vec![CaseResult {
            id: "case-1".into(),
            kind: CaseKind::Bundle,
            pass: true,
            expected: Expected {
                exit_code: 0,
                ok: true,
                verification_ok: true,
                error_codes: vec![],
                warning_codes: vec![],
            },
            actual: CaseOutcome {
                exit_code: 0,
                ok: true,
                verification_ok: true,
                error_codes: vec![],
                warning_codes: vec![],
            },
        }]
    }

    #[test]
    fn report_and_cert_pass_strict_validation() {
        let report = build_run_report("run-1", &sample_results(), AT, AT).unwrap();
        let cert = build_cert_bundle(&report, AT).unwrap();
        let out = validate_strict_artifacts(&report, &cert);
        assert!(out.ok, "{out:?}");
    }

    #[test]
    fn flipped_byte_in_embedded_core_fails_strict() {
        let report = build_run_report("run-1", &sample_results(), AT, AT).unwrap();
        let mut cert = build_cert_bundle(&report, AT).unwrap();
        // Tamper inside certCore.reportCore, then re-seal the cert so only
        // the cross-check can catch the drift.
        cert["certCore"]["reportCore"]["passedCount"] = json!(99);
        cert["certCore"]["reportHash"] = json!(
            settld_canon::canonical_hash(&cert["certCore"]["reportCore"]).unwrap()
        );
        cert["certHash"] = json!(settld_canon::canonical_hash(&cert["certCore"]).unwrap());

        let out = validate_strict_artifacts(&report, &cert);
        assert!(out
            .error_codes()
            .contains(&"CONFORMANCE_STRICT_ARTIFACT_VALIDATION_FAILED".to_string()));
    }

    #[test]
    fn report_totals_are_consistent() {
        let report = build_run_report("run-1", &sample_results(), AT, AT).unwrap();
        assert_eq!(report["reportCore"]["caseCount"], 1);
        assert_eq!(report["reportCore"]["passedCount"], 1);
        assert_eq!(report["reportCore"]["failedCount"], 0);
    }
}
