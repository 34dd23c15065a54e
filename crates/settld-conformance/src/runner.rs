// SPDX-License-Identifier: MIT OR Apache-2.0
//! Case execution.
//!
//! Each case stages its fixture into a temp dir, applies mutations, invokes
//! the verifier matching its kind, and diffs the observed outcome against
//! the expectation. Verifier exit-code semantics match the CLI: 0 pass,
//! 1 verification failure, 2 usage/IO error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

use settld_artifact::Report;
use settld_bundle::UnzipBudget;

use crate::mutate::Mutation;
use crate::{build_cert_bundle, build_run_report};

/// Which verifier a case exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseKind {
    /// Deterministic ZIP bundle (`verify_bundle`).
    Bundle,
    /// Session replay pack JSON (`verify_replay_pack`).
    ReplayPack,
    /// x402 settlement receipt JSON (`verify_settlement_receipt`).
    SettlementReceipt,
    /// Work-order metering snapshot JSON (`verify_metering_snapshot`).
    MeteringSnapshot,
}

/// Expected outcome of a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expected {
    /// Expected process exit code.
    pub exit_code: i32,
    /// Expected overall `ok`.
    pub ok: bool,
    /// Expected verifier `ok`.
    pub verification_ok: bool,
    /// Error codes that must be present, in any order.
    #[serde(default)]
    pub error_codes: Vec<String>,
    /// Warning codes that must be present, in any order.
    #[serde(default)]
    pub warning_codes: Vec<String>,
}

/// One conformance case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    /// Case id.
    pub id: String,
    /// Verifier kind.
    pub kind: CaseKind,
    /// Fixture path relative to the pack dir.
    pub bundle_path: String,
    /// Mutations applied to the staged fixture.
    #[serde(default)]
    pub mutations: Vec<Mutation>,
    /// Expected outcome.
    pub expected: Expected,
}

/// Observed outcome of a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseOutcome {
    /// Exit code the CLI would report.
    pub exit_code: i32,
    /// Overall ok (runner-level and verifier-level).
    pub ok: bool,
    /// Verifier ok.
    pub verification_ok: bool,
    /// Error codes observed.
    pub error_codes: Vec<String>,
    /// Warning codes observed.
    pub warning_codes: Vec<String>,
}

/// A case plus its diffed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    /// Case id.
    pub id: String,
    /// Verifier kind.
    pub kind: CaseKind,
    /// Whether actual matched expected.
    pub pass: bool,
    /// The expectation.
    pub expected: Expected,
    /// The observation.
    pub actual: CaseOutcome,
}

/// Run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Cross-validate the report/cert pair before returning.
    pub strict_artifacts: bool,
    /// Unzip budgets for bundle cases.
    pub budget: Option<UnzipBudget>,
}

/// Errors from pack loading and execution.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The pack dir or a fixture could not be read.
    #[error("pack io error: {0}")]
    Io(#[from] std::io::Error),

    /// `cases.json` is malformed.
    #[error("cases.json invalid: {0}")]
    Cases(#[from] serde_json::Error),

    /// Artifact assembly failed.
    #[error(transparent)]
    Canon(#[from] settld_canon::CanonError),

    /// Strict-artifact validation failed after the run.
    #[error("CONFORMANCE_STRICT_ARTIFACT_VALIDATION_FAILED")]
    StrictValidation {
        /// The failing report.
        report: Box<Report>,
    },
}

/// The artifacts of a completed run.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    /// Sealed `ConformanceRunReport.v1`.
    pub report: Value,
    /// Sealed `ConformanceCertBundle.v1`.
    pub cert_bundle: Value,
    /// Per-case results.
    pub results: Vec<CaseResult>,
}

/// Run every case in a pack directory.
///
/// # Errors
///
/// [`RunError`] for pack-level failures; per-case verification failures are
/// recorded in the results, never raised.
pub fn run_pack(pack_dir: &Path, options: &RunOptions, now_iso: &str) -> Result<RunArtifacts, RunError> {
    let cases: Vec<Case> = serde_json::from_slice(&fs::read(pack_dir.join("cases.json"))?)?;
    let budget = options.budget.unwrap_or_default();

    let mut results = Vec::with_capacity(cases.len());
    for case in &cases {
        let actual = run_case(pack_dir, case, &budget);
        let pass = outcome_matches(&case.expected, &actual);
        results.push(CaseResult {
            id: case.id.clone(),
            kind: case.kind,
            pass,
            expected: case.expected.clone(),
            actual,
        });
    }

    let run_id = settld_canon::ids::new_id(settld_canon::ids::IdPrefix::Rfq);
    let report = build_run_report(&run_id, &results, now_iso, now_iso)?;
    let cert_bundle = build_cert_bundle(&report, now_iso)?;

    if options.strict_artifacts {
        let strict = crate::validate_strict_artifacts(&report, &cert_bundle);
        if !strict.ok {
            return Err(RunError::StrictValidation {
                report: Box::new(strict),
            });
        }
    }

    Ok(RunArtifacts {
        report,
        cert_bundle,
        results,
    })
}

fn run_case(pack_dir: &Path, case: &Case, budget: &UnzipBudget) -> CaseOutcome {
    match stage_and_verify(pack_dir, case, budget) {
        Ok(report) => CaseOutcome {
            exit_code: i32::from(!report.ok),
            ok: report.ok,
            verification_ok: report.ok,
            error_codes: report.error_codes(),
            warning_codes: report.warning_codes(),
        },
        // Usage/IO failures are exit code 2 with no verifier output.
        Err(error_code) => CaseOutcome {
            exit_code: 2,
            ok: false,
            verification_ok: false,
            error_codes: vec![error_code],
            warning_codes: vec![],
        },
    }
}

fn stage_and_verify(
    pack_dir: &Path,
    case: &Case,
    budget: &UnzipBudget,
) -> Result<Report, String> {
    let staging = tempfile::tempdir().map_err(|e| format!("IO_ERROR: {e}"))?;
    let fixture_name = Path::new(&case.bundle_path)
        .file_name()
        .ok_or_else(|| "IO_ERROR: fixture has no file name".to_string())?;
    let staged = staging.path().join(fixture_name);
    fs::copy(pack_dir.join(&case.bundle_path), &staged)
        .map_err(|e| format!("IO_ERROR: {e}"))?;

    for mutation in &case.mutations {
        mutation
            .apply(staging.path())
            .map_err(|e| format!("MUTATION_ERROR: {e}"))?;
    }

    // A mutation may have deleted the fixture entirely.
    let bytes = fs::read(&staged).map_err(|e| format!("IO_ERROR: {e}"))?;

    Ok(match case.kind {
        CaseKind::Bundle => settld_bundle::verify_bundle(&bytes, budget),
        CaseKind::ReplayPack => {
            let doc: Value =
                serde_json::from_slice(&bytes).map_err(|e| format!("IO_ERROR: {e}"))?;
            settld_session::verify_replay_pack(&doc, None)
        }
        CaseKind::SettlementReceipt => {
            let doc: Value =
                serde_json::from_slice(&bytes).map_err(|e| format!("IO_ERROR: {e}"))?;
            settld_gate::verify_settlement_receipt(&doc)
        }
        CaseKind::MeteringSnapshot => {
            let doc: Value =
                serde_json::from_slice(&bytes).map_err(|e| format!("IO_ERROR: {e}"))?;
            settld_workorder::verify_metering_snapshot(&doc)
        }
    })
}

fn outcome_matches(expected: &Expected, actual: &CaseOutcome) -> bool {
    expected.exit_code == actual.exit_code
        && expected.ok == actual.ok
        && expected.verification_ok == actual.verification_ok
        && expected
            .error_codes
            .iter()
            .all(|c| actual.error_codes.contains(c))
        && expected
            .warning_codes
            .iter()
            .all(|c| actual.warning_codes.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const AT: &str = "2026-02-02T00:00:00.000Z";

    /// Build a pack dir with one bundle fixture and the given cases.
    fn pack_with(cases: &[Case], bundle: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fixture.zip"), bundle).unwrap();
        fs::write(
            dir.path().join("cases.json"),
            serde_json::to_vec(cases).unwrap(),
        )
        .unwrap();
        dir
    }

    fn good_bundle() -> Vec<u8> {
        settld_bundle::build_bundle(&[(
            "report.json".to_string(),
            "report".to_string(),
            br#"{"ok":true}"#.to_vec(),
        )])
        .unwrap()
    }

    fn expected_pass() -> Expected {
        Expected {
            exit_code: 0,
            ok: true,
            verification_ok: true,
            error_codes: vec![],
            warning_codes: vec![],
        }
    }

    #[test]
    fn clean_bundle_case_passes() {
        let pack = pack_with(
            &[Case {
                id: "clean".into(),
                kind: CaseKind::Bundle,
                bundle_path: "fixture.zip".into(),
                mutations: vec![],
                expected: expected_pass(),
            }],
            &good_bundle(),
        );
        let run = run_pack(pack.path(), &RunOptions::default(), AT).unwrap();
        assert!(run.results[0].pass, "{:?}", run.results[0]);
        assert_eq!(run.report["reportCore"]["passedCount"], 1);
    }

    #[test]
    fn flip_byte_case_expects_failure_and_passes() {
        let pack = pack_with(
            &[Case {
                id: "tampered".into(),
                kind: CaseKind::Bundle,
                bundle_path: "fixture.zip".into(),
                // Flip a byte in the first local header's data region.
                mutations: vec![Mutation::FlipByte {
                    file: "fixture.zip".into(),
                    offset: 45,
                }],
                expected: Expected {
                    exit_code: 1,
                    ok: false,
                    verification_ok: false,
                    error_codes: vec!["ZIP_UNSAFE_ENTRY".into()],
                    warning_codes: vec![],
                },
            }],
            &good_bundle(),
        );
        let run = run_pack(pack.path(), &RunOptions::default(), AT).unwrap();
        assert!(run.results[0].pass, "{:?}", run.results[0]);
    }

    #[test]
    fn wrong_expectation_fails_the_case_not_the_run() {
        let pack = pack_with(
            &[Case {
                id: "wrong".into(),
                kind: CaseKind::Bundle,
                bundle_path: "fixture.zip".into(),
                mutations: vec![],
                expected: Expected {
                    exit_code: 1,
                    ok: false,
                    verification_ok: false,
                    error_codes: vec![],
                    warning_codes: vec![],
                },
            }],
            &good_bundle(),
        );
        let run = run_pack(pack.path(), &RunOptions::default(), AT).unwrap();
        assert!(!run.results[0].pass);
        assert_eq!(run.report["reportCore"]["failedCount"], 1);
    }

    #[test]
    fn deleted_fixture_is_exit_code_2() {
        let pack = pack_with(
            &[Case {
                id: "gone".into(),
                kind: CaseKind::Bundle,
                bundle_path: "fixture.zip".into(),
                mutations: vec![Mutation::DeleteFile {
                    file: "fixture.zip".into(),
                }],
                expected: Expected {
                    exit_code: 2,
                    ok: false,
                    verification_ok: false,
                    error_codes: vec![],
                    warning_codes: vec![],
                },
            }],
            &good_bundle(),
        );
        let run = run_pack(pack.path(), &RunOptions::default(), AT).unwrap();
        assert!(run.results[0].pass, "{:?}", run.results[0]);
    }

    #[test]
    fn replay_pack_case_with_json_mutation() {
        // Build a replay pack fixture, then mutate its head hash.
        let store = settld_store::MemoryStore::new();
        let session = settld_session::Session::new("tenant-a", vec![], vec![], AT).unwrap();
        settld_session::append_session_event(
            &store,
            &session,
            "MESSAGE",
            settld_chain::EventActor::new("agent", "agt_a"),
            json!({"text": "hi"}),
            None,
        )
        .unwrap();
        let events = settld_store::Store::list_events(
            &store,
            "tenant-a",
            &session.session_id,
            None,
            None,
        )
        .unwrap();
        let pack_artifact =
            settld_session::build_replay_pack(&session, &events, AT, None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("pack.json"),
            serde_json::to_vec(&pack_artifact).unwrap(),
        )
        .unwrap();
        fs::write(
            dir.path().join("cases.json"),
            serde_json::to_vec(&[Case {
                id: "tampered-head".into(),
                kind: CaseKind::ReplayPack,
                bundle_path: "pack.json".into(),
                mutations: vec![Mutation::SetJson {
                    file: "pack.json".into(),
                    pointer: "/packCore/headChainHash".into(),
                    value: json!("0".repeat(64)),
                }],
                expected: Expected {
                    exit_code: 1,
                    ok: false,
                    verification_ok: false,
                    error_codes: vec!["ARTIFACT_HASH_MISMATCH".into()],
                    warning_codes: vec![],
                },
            }])
            .unwrap(),
        )
        .unwrap();

        let run = run_pack(dir.path(), &RunOptions::default(), AT).unwrap();
        assert!(run.results[0].pass, "{:?}", run.results[0]);
    }

    #[test]
    fn strict_mode_validates_emitted_pair() {
        let pack = pack_with(
            &[Case {
                id: "clean".into(),
                kind: CaseKind::Bundle,
                bundle_path: "fixture.zip".into(),
                mutations: vec![],
                expected: expected_pass(),
            }],
            &good_bundle(),
        );
        let run = run_pack(
            pack.path(),
            &RunOptions {
                strict_artifacts: true,
                budget: None,
            },
            AT,
        )
        .unwrap();
        assert!(crate::validate_strict_artifacts(&run.report, &run.cert_bundle).ok);
    }
}
