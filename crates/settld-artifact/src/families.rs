// SPDX-License-Identifier: MIT OR Apache-2.0
//! Finance and close artifact families.
//!
//! Each family is a typed core plus a `build_*`/`verify_*` pair. Builders are
//! pure; verifiers layer family-specific invariants on top of the shared seal
//! check. Bindings between artifacts are always by hash plus typed id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use settld_canon::CanonError;
use settld_error::ErrorCode;

use crate::{seal, verify_seal, ArtifactSpec, Report};

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// `CloseReport.v1` wire shape.
pub const CLOSE_REPORT: ArtifactSpec = ArtifactSpec {
    name: "CloseReport",
    version: 1,
    hash_field: "closeReportHash",
    core_field: "closeReportCore",
};

/// `CloseBundle.v1` wire shape.
pub const CLOSE_BUNDLE: ArtifactSpec = ArtifactSpec {
    name: "CloseBundle",
    version: 1,
    hash_field: "closeBundleHash",
    core_field: "closeBundleCore",
};

/// `ClosePack.v1` wire shape.
pub const CLOSE_PACK: ArtifactSpec = ArtifactSpec {
    name: "ClosePack",
    version: 1,
    hash_field: "closePackHash",
    core_field: "closePackCore",
};

/// `JobProofBundle.v1` wire shape.
pub const JOB_PROOF_BUNDLE: ArtifactSpec = ArtifactSpec {
    name: "JobProofBundle",
    version: 1,
    hash_field: "jobProofHash",
    core_field: "jobProofCore",
};

/// `MonthProofBundle.v1` wire shape.
pub const MONTH_PROOF_BUNDLE: ArtifactSpec = ArtifactSpec {
    name: "MonthProofBundle",
    version: 1,
    hash_field: "monthProofHash",
    core_field: "monthProofCore",
};

/// `InvoiceBundle.v1` wire shape.
pub const INVOICE_BUNDLE: ArtifactSpec = ArtifactSpec {
    name: "InvoiceBundle",
    version: 1,
    hash_field: "invoiceHash",
    core_field: "invoiceCore",
};

/// `FinancePack.v1` wire shape.
pub const FINANCE_PACK: ArtifactSpec = ArtifactSpec {
    name: "FinancePack",
    version: 1,
    hash_field: "financePackHash",
    core_field: "financePackCore",
};

/// `ProtocolCompatibilityMatrixReport.v1` wire shape.
pub const COMPAT_MATRIX_REPORT: ArtifactSpec = ArtifactSpec {
    name: "ProtocolCompatibilityMatrixReport",
    version: 1,
    hash_field: "matrixHash",
    core_field: "matrixCore",
};

// ---------------------------------------------------------------------------
// Shared shapes
// ---------------------------------------------------------------------------

/// A stream head captured by hash at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHead {
    /// Stream id.
    pub stream_id: String,
    /// Head chain hash at capture time.
    pub chain_hash: String,
    /// Event count at capture time.
    pub event_count: u64,
}

/// Hash-plus-typed-id reference to another artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    /// Artifact kind.
    pub kind: String,
    /// Artifact id.
    pub id: String,
    /// The referenced artifact's core hash.
    pub hash: String,
}

// ---------------------------------------------------------------------------
// CloseReport
// ---------------------------------------------------------------------------

/// Monthly close totals in integer cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTotals {
    /// Total invoiced.
    pub invoiced_cents: i64,
    /// Total released to payees.
    pub released_cents: i64,
    /// Total refunded to payers.
    pub refunded_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
}

/// Hashed core of a tenant/month close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseReportCore {
    /// Tenant being closed.
    pub tenant_id: String,
    /// Month in `YYYY-MM` form.
    pub month: String,
    /// Every stream head captured at close time.
    pub stream_heads: Vec<StreamHead>,
    /// Total events across all captured streams.
    pub event_count_total: u64,
    /// Monetary totals.
    pub totals: CloseTotals,
}

/// Build a sealed `CloseReport.v1`.
///
/// # Errors
///
/// Returns [`CanonError`] on canonicalization failure.
pub fn build_close_report(core: &CloseReportCore, generated_at: &str) -> Result<Value, CanonError> {
    let core = serde_json::to_value(core)?;
    seal(&CLOSE_REPORT, &core, generated_at)
}

/// Verify a `CloseReport.v1`: seal plus internal event-count consistency.
#[must_use]
pub fn verify_close_report(artifact: &Value) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&CLOSE_REPORT, artifact, &mut report) else {
        return report;
    };
    let Ok(core) = serde_json::from_value::<CloseReportCore>(core.clone()) else {
        report.error_code(ErrorCode::SchemaInvalid, CLOSE_REPORT.core_field, "core shape invalid");
        return report;
    };
    let sum: u64 = core.stream_heads.iter().map(|h| h.event_count).sum();
    if sum != core.event_count_total {
        report.error_code(
            ErrorCode::SchemaInvalid,
            "closeReportCore.eventCountTotal",
            format!("declared {} but stream heads sum to {sum}", core.event_count_total),
        );
    }
    report
}

// ---------------------------------------------------------------------------
// CloseBundle / ClosePack
// ---------------------------------------------------------------------------

/// Hashed core of a close bundle: the close report hash plus the artifact
/// set it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseBundleCore {
    /// Tenant being closed.
    pub tenant_id: String,
    /// Month in `YYYY-MM` form.
    pub month: String,
    /// Hash of the bound `CloseReportCore`.
    pub close_report_hash: String,
    /// Artifacts included in the close.
    pub artifact_refs: Vec<ArtifactRef>,
}

/// Build a sealed `CloseBundle.v1`.
///
/// # Errors
///
/// Returns [`CanonError`] on canonicalization failure.
pub fn build_close_bundle(core: &CloseBundleCore, generated_at: &str) -> Result<Value, CanonError> {
    let core = serde_json::to_value(core)?;
    seal(&CLOSE_BUNDLE, &core, generated_at)
}

/// Verify a `CloseBundle.v1` against its close report artifact.
///
/// The bundle's `closeReportHash` must equal the recomputed hash of the
/// report's core — the one-way binding that replaces a runtime back-pointer.
#[must_use]
pub fn verify_close_bundle(artifact: &Value, close_report: &Value) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&CLOSE_BUNDLE, artifact, &mut report) else {
        return report;
    };
    let report_check = verify_close_report(close_report);
    if !report_check.ok {
        report.merge(report_check);
        return report;
    }
    let declared = core
        .get("closeReportHash")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if let Some(bound_core) = close_report.get(CLOSE_REPORT.core_field) {
        crate::verify_cross_binding(declared, bound_core, "closeBundleCore.closeReportHash", &mut report);
    }
    report
}

/// Hashed core of the top-level close pack binding report, finance pack, and
/// month proof by hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePackCore {
    /// Tenant being closed.
    pub tenant_id: String,
    /// Month in `YYYY-MM` form.
    pub month: String,
    /// Hash of the bound `CloseReportCore`.
    pub close_report_hash: String,
    /// Hash of the bound `FinancePackCore`.
    pub finance_pack_hash: String,
    /// Hash of the bound `MonthProofBundleCore`.
    pub month_proof_hash: String,
}

/// Build a sealed `ClosePack.v1`.
///
/// # Errors
///
/// Returns [`CanonError`] on canonicalization failure.
pub fn build_close_pack(core: &ClosePackCore, generated_at: &str) -> Result<Value, CanonError> {
    let core = serde_json::to_value(core)?;
    seal(&CLOSE_PACK, &core, generated_at)
}

/// Verify a `ClosePack.v1` and its three hash bindings.
#[must_use]
pub fn verify_close_pack(
    artifact: &Value,
    close_report: &Value,
    finance_pack: &Value,
    month_proof: &Value,
) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&CLOSE_PACK, artifact, &mut report) else {
        return report;
    };
    for (field, bound_artifact, bound_spec) in [
        ("closeReportHash", close_report, &CLOSE_REPORT),
        ("financePackHash", finance_pack, &FINANCE_PACK),
        ("monthProofHash", month_proof, &MONTH_PROOF_BUNDLE),
    ] {
        let declared = core.get(field).and_then(Value::as_str).unwrap_or_default();
        match bound_artifact.get(bound_spec.core_field) {
            Some(bound_core) => crate::verify_cross_binding(
                declared,
                bound_core,
                &format!("closePackCore.{field}"),
                &mut report,
            ),
            None => report.error_code(
                ErrorCode::SchemaInvalid,
                bound_spec.core_field,
                format!("bound artifact is missing {}", bound_spec.core_field),
            ),
        }
    }
    report
}

// ---------------------------------------------------------------------------
// JobProofBundle / MonthProofBundle
// ---------------------------------------------------------------------------

/// Hashed core of a per-job proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProofBundleCore {
    /// Job identifier.
    pub job_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// The job stream's head at proof time.
    pub stream_head: StreamHead,
    /// Work-order metering digest, when the job was metered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metering_digest: Option<String>,
    /// Evidence references (`http:request_sha256:<hex>`, file hashes, …).
    pub evidence_refs: Vec<String>,
}

/// Build a sealed `JobProofBundle.v1`.
///
/// # Errors
///
/// Returns [`CanonError`] on canonicalization failure.
pub fn build_job_proof_bundle(
    core: &JobProofBundleCore,
    generated_at: &str,
) -> Result<Value, CanonError> {
    let core = serde_json::to_value(core)?;
    seal(&JOB_PROOF_BUNDLE, &core, generated_at)
}

/// Verify a `JobProofBundle.v1`.
#[must_use]
pub fn verify_job_proof_bundle(artifact: &Value) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&JOB_PROOF_BUNDLE, artifact, &mut report) else {
        return report;
    };
    if let Some(head) = core.get("streamHead")
        && head
            .get("chainHash")
            .and_then(Value::as_str)
            .is_none_or(|h| !settld_canon::is_hex_digest(h))
    {
        report.error_code(
            ErrorCode::SchemaInvalid,
            "jobProofCore.streamHead.chainHash",
            "not a hex digest",
        );
    }
    report
}

/// Hashed core of a month-level proof rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthProofBundleCore {
    /// Owning tenant.
    pub tenant_id: String,
    /// Month in `YYYY-MM` form.
    pub month: String,
    /// Core hashes of every job proof in the month, in job order.
    pub job_proof_hashes: Vec<String>,
}

/// Build a sealed `MonthProofBundle.v1`.
///
/// # Errors
///
/// Returns [`CanonError`] on canonicalization failure.
pub fn build_month_proof_bundle(
    core: &MonthProofBundleCore,
    generated_at: &str,
) -> Result<Value, CanonError> {
    let core = serde_json::to_value(core)?;
    seal(&MONTH_PROOF_BUNDLE, &core, generated_at)
}

/// Verify a `MonthProofBundle.v1` against the job proofs it claims to cover.
#[must_use]
pub fn verify_month_proof_bundle(artifact: &Value, job_proofs: &[Value]) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&MONTH_PROOF_BUNDLE, artifact, &mut report) else {
        return report;
    };
    let declared: Vec<&str> = core
        .get("jobProofHashes")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if declared.len() != job_proofs.len() {
        report.error_code(
            ErrorCode::CrossArtifactBindingMismatch,
            "monthProofCore.jobProofHashes",
            format!("declares {} proofs, given {}", declared.len(), job_proofs.len()),
        );
        return report;
    }
    for (i, (hash, proof)) in declared.iter().zip(job_proofs).enumerate() {
        match proof.get(JOB_PROOF_BUNDLE.core_field) {
            Some(bound_core) => crate::verify_cross_binding(
                hash,
                bound_core,
                &format!("monthProofCore.jobProofHashes[{i}]"),
                &mut report,
            ),
            None => report.error_code(
                ErrorCode::SchemaInvalid,
                format!("jobProofs[{i}]"),
                "missing jobProofCore",
            ),
        }
    }
    report
}

// ---------------------------------------------------------------------------
// InvoiceBundle / FinancePack
// ---------------------------------------------------------------------------

/// One invoice line item in integer cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLineItem {
    /// Billable SKU tag.
    pub sku: String,
    /// Human-readable description.
    pub description: String,
    /// Quantity billed.
    pub quantity: u64,
    /// Line amount in cents.
    pub amount_cents: i64,
}

/// Hashed core of an invoice bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceBundleCore {
    /// Invoice identifier.
    pub invoice_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Month in `YYYY-MM` form.
    pub month: String,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Ordered line items.
    pub line_items: Vec<InvoiceLineItem>,
    /// Declared total; must equal the line-item sum.
    pub total_cents: i64,
}

/// Build a sealed `InvoiceBundle.v1`.
///
/// # Errors
///
/// Returns [`CanonError`] on canonicalization failure.
pub fn build_invoice_bundle(
    core: &InvoiceBundleCore,
    generated_at: &str,
) -> Result<Value, CanonError> {
    let core = serde_json::to_value(core)?;
    seal(&INVOICE_BUNDLE, &core, generated_at)
}

/// Verify an `InvoiceBundle.v1`: seal plus total arithmetic.
#[must_use]
pub fn verify_invoice_bundle(artifact: &Value) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&INVOICE_BUNDLE, artifact, &mut report) else {
        return report;
    };
    let Ok(core) = serde_json::from_value::<InvoiceBundleCore>(core.clone()) else {
        report.error_code(ErrorCode::SchemaInvalid, INVOICE_BUNDLE.core_field, "core shape invalid");
        return report;
    };
    let sum: i64 = core.line_items.iter().map(|l| l.amount_cents).sum();
    if sum != core.total_cents {
        report.error_code(
            ErrorCode::SchemaInvalid,
            "invoiceCore.totalCents",
            format!("declared {} but line items sum to {sum}", core.total_cents),
        );
    }
    report
}

/// Hashed core of a finance pack reconciling a month's invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancePackCore {
    /// Owning tenant.
    pub tenant_id: String,
    /// Month in `YYYY-MM` form.
    pub month: String,
    /// Core hashes of every invoice bundle covered.
    pub invoice_bundle_hashes: Vec<String>,
    /// Total invoiced in cents.
    pub invoiced_total_cents: i64,
    /// Total released in cents.
    pub released_total_cents: i64,
    /// Total refunded in cents.
    pub refunded_total_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
}

/// Build a sealed `FinancePack.v1`.
///
/// # Errors
///
/// Returns [`CanonError`] on canonicalization failure.
pub fn build_finance_pack(core: &FinancePackCore, generated_at: &str) -> Result<Value, CanonError> {
    let core = serde_json::to_value(core)?;
    seal(&FINANCE_PACK, &core, generated_at)
}

/// Verify a `FinancePack.v1`: seal plus reconciliation arithmetic.
#[must_use]
pub fn verify_finance_pack(artifact: &Value) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&FINANCE_PACK, artifact, &mut report) else {
        return report;
    };
    let Ok(core) = serde_json::from_value::<FinancePackCore>(core.clone()) else {
        report.error_code(ErrorCode::SchemaInvalid, FINANCE_PACK.core_field, "core shape invalid");
        return report;
    };
    if core.released_total_cents + core.refunded_total_cents != core.invoiced_total_cents {
        report.error_code(
            ErrorCode::SchemaInvalid,
            "financePackCore.invoicedTotalCents",
            format!(
                "released {} + refunded {} != invoiced {}",
                core.released_total_cents, core.refunded_total_cents, core.invoiced_total_cents
            ),
        );
    }
    report
}

// ---------------------------------------------------------------------------
// ProtocolCompatibilityMatrixReport
// ---------------------------------------------------------------------------

/// Compatibility status of one protocol row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatStatus {
    /// Fully supported.
    Supported,
    /// Supported but scheduled for removal.
    Deprecated,
    /// Not supported.
    Unsupported,
}

/// One protocol/version row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatMatrixRow {
    /// Protocol name.
    pub protocol: String,
    /// Protocol version string.
    pub version: String,
    /// Compatibility status.
    pub status: CompatStatus,
}

/// Hashed core of the protocol compatibility matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatMatrixCore {
    /// What the matrix was generated for (release tag, service version).
    pub generated_for: String,
    /// Matrix rows in protocol order.
    pub rows: Vec<CompatMatrixRow>,
}

/// Build a sealed `ProtocolCompatibilityMatrixReport.v1`.
///
/// # Errors
///
/// Returns [`CanonError`] on canonicalization failure.
pub fn build_compat_matrix_report(
    core: &CompatMatrixCore,
    generated_at: &str,
) -> Result<Value, CanonError> {
    let core = serde_json::to_value(core)?;
    seal(&COMPAT_MATRIX_REPORT, &core, generated_at)
}

/// Verify a `ProtocolCompatibilityMatrixReport.v1`.
#[must_use]
pub fn verify_compat_matrix_report(artifact: &Value) -> Report {
    let mut report = Report::new();
    if verify_seal(&COMPAT_MATRIX_REPORT, artifact, &mut report).is_some()
        && artifact[COMPAT_MATRIX_REPORT.core_field]
            .get("rows")
            .and_then(Value::as_array)
            .is_none_or(Vec::is_empty)
    {
        report.warning("EMPTY_MATRIX", "matrixCore.rows", "matrix has no rows");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use settld_canon::canonical_hash;

    const AT: &str = "2026-02-02T00:00:00.000Z";

    fn close_report_core() -> CloseReportCore {
        CloseReportCore {
            tenant_id: "tenant-a".into(),
            month: "2026-01".into(),
            stream_heads: vec![
                StreamHead {
                    stream_id: "s1".into(),
                    chain_hash: "a".repeat(64),
                    event_count: 3,
                },
                StreamHead {
                    stream_id: "s2".into(),
                    chain_hash: "b".repeat(64),
                    event_count: 2,
                },
            ],
            event_count_total: 5,
            totals: CloseTotals {
                invoiced_cents: 1500,
                released_cents: 1200,
                refunded_cents: 300,
                currency: "USD".into(),
            },
        }
    }

    #[test]
    fn close_report_roundtrip() {
        let artifact = build_close_report(&close_report_core(), AT).unwrap();
        let report = verify_close_report(&artifact);
        assert!(report.ok, "{report:?}");
    }

    #[test]
    fn close_report_event_count_mismatch() {
        let mut core = close_report_core();
        core.event_count_total = 99;
        let artifact = build_close_report(&core, AT).unwrap();
        let report = verify_close_report(&artifact);
        assert_eq!(report.error_codes(), vec!["SCHEMA_INVALID"]);
    }

    #[test]
    fn close_bundle_binds_report_by_hash() {
        let report_artifact = build_close_report(&close_report_core(), AT).unwrap();
        let report_core_hash =
            canonical_hash(&report_artifact[CLOSE_REPORT.core_field]).unwrap();
        let bundle = build_close_bundle(
            &CloseBundleCore {
                tenant_id: "tenant-a".into(),
                month: "2026-01".into(),
                close_report_hash: report_core_hash,
                artifact_refs: vec![],
            },
            AT,
        )
        .unwrap();
        assert!(verify_close_bundle(&bundle, &report_artifact).ok);

        // Re-seal a tampered report: the report itself verifies, but the
        // bundle's binding breaks.
        let mut tampered = report_artifact.clone();
        tampered[CLOSE_REPORT.core_field]["month"] = serde_json::json!("2026-02");
        tampered[CLOSE_REPORT.hash_field] =
            serde_json::json!(canonical_hash(&tampered[CLOSE_REPORT.core_field]).unwrap());
        let result = verify_close_bundle(&bundle, &tampered);
        assert!(result
            .error_codes()
            .contains(&"CROSS_ARTIFACT_BINDING_MISMATCH".to_string()));
    }

    #[test]
    fn invoice_total_must_match_line_items() {
        let core = InvoiceBundleCore {
            invoice_id: "inv-1".into(),
            tenant_id: "tenant-a".into(),
            month: "2026-01".into(),
            currency: "USD".into(),
            line_items: vec![
                InvoiceLineItem {
                    sku: "runs".into(),
                    description: "agent runs".into(),
                    quantity: 10,
                    amount_cents: 1000,
                },
                InvoiceLineItem {
                    sku: "storage".into(),
                    description: "bundle storage".into(),
                    quantity: 1,
                    amount_cents: 250,
                },
            ],
            total_cents: 1250,
        };
        assert!(verify_invoice_bundle(&build_invoice_bundle(&core, AT).unwrap()).ok);

        let mut bad = core;
        bad.total_cents = 9999;
        let report = verify_invoice_bundle(&build_invoice_bundle(&bad, AT).unwrap());
        assert_eq!(report.error_codes(), vec!["SCHEMA_INVALID"]);
    }

    #[test]
    fn finance_pack_reconciliation() {
        let core = FinancePackCore {
            tenant_id: "tenant-a".into(),
            month: "2026-01".into(),
            invoice_bundle_hashes: vec!["c".repeat(64)],
            invoiced_total_cents: 1500,
            released_total_cents: 1200,
            refunded_total_cents: 300,
            currency: "USD".into(),
        };
        assert!(verify_finance_pack(&build_finance_pack(&core, AT).unwrap()).ok);

        let mut bad = core;
        bad.released_total_cents = 1300;
        let report = verify_finance_pack(&build_finance_pack(&bad, AT).unwrap());
        assert!(!report.ok);
    }

    #[test]
    fn month_proof_binds_each_job_proof() {
        let job = JobProofBundleCore {
            job_id: "job-1".into(),
            tenant_id: "tenant-a".into(),
            stream_head: StreamHead {
                stream_id: "s1".into(),
                chain_hash: "d".repeat(64),
                event_count: 4,
            },
            metering_digest: Some("e".repeat(64)),
            evidence_refs: vec![format!("http:request_sha256:{}", "f".repeat(64))],
        };
        let job_artifact = build_job_proof_bundle(&job, AT).unwrap();
        assert!(verify_job_proof_bundle(&job_artifact).ok);

        let hash = canonical_hash(&job_artifact[JOB_PROOF_BUNDLE.core_field]).unwrap();
        let month = build_month_proof_bundle(
            &MonthProofBundleCore {
                tenant_id: "tenant-a".into(),
                month: "2026-01".into(),
                job_proof_hashes: vec![hash],
            },
            AT,
        )
        .unwrap();
        assert!(verify_month_proof_bundle(&month, std::slice::from_ref(&job_artifact)).ok);

        let report = verify_month_proof_bundle(&month, &[]);
        assert_eq!(report.error_codes(), vec!["CROSS_ARTIFACT_BINDING_MISMATCH"]);
    }

    #[test]
    fn close_pack_binds_three_artifacts() {
        let report_artifact = build_close_report(&close_report_core(), AT).unwrap();
        let finance = build_finance_pack(
            &FinancePackCore {
                tenant_id: "tenant-a".into(),
                month: "2026-01".into(),
                invoice_bundle_hashes: vec![],
                invoiced_total_cents: 0,
                released_total_cents: 0,
                refunded_total_cents: 0,
                currency: "USD".into(),
            },
            AT,
        )
        .unwrap();
        let month = build_month_proof_bundle(
            &MonthProofBundleCore {
                tenant_id: "tenant-a".into(),
                month: "2026-01".into(),
                job_proof_hashes: vec![],
            },
            AT,
        )
        .unwrap();
        let pack = build_close_pack(
            &ClosePackCore {
                tenant_id: "tenant-a".into(),
                month: "2026-01".into(),
                close_report_hash: canonical_hash(&report_artifact[CLOSE_REPORT.core_field])
                    .unwrap(),
                finance_pack_hash: canonical_hash(&finance[FINANCE_PACK.core_field]).unwrap(),
                month_proof_hash: canonical_hash(&month[MONTH_PROOF_BUNDLE.core_field]).unwrap(),
            },
            AT,
        )
        .unwrap();
        let result = verify_close_pack(&pack, &report_artifact, &finance, &month);
        assert!(result.ok, "{result:?}");
    }

    #[test]
    fn deterministic_build_given_fixed_generated_at() {
        let a = build_close_report(&close_report_core(), AT).unwrap();
        let b = build_close_report(&close_report_core(), AT).unwrap();
        assert_eq!(
            settld_canon::canonical_string(&a).unwrap(),
            settld_canon::canonical_string(&b).unwrap()
        );
    }
}
