// SPDX-License-Identifier: MIT OR Apache-2.0
//! Work orders and metering.
//!
//! A work order owns an ordered list of meters; each top-up appends one.
//! The metering arithmetic is an invariant, not a cache:
//! `covered = base + Σ top-ups`, `remaining = max(0, maxCost − covered)`,
//! and the meter digest hashes the ordered list of per-meter hashes.
//! Completion emits a receipt bound to the digest and the paying x402 gate.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use settld_artifact::{seal, verify_seal, ArtifactSpec, Report};
use settld_canon::ids::{new_id, IdPrefix};
use settld_canon::{canonical_hash, sha256_hex};
use settld_error::{ErrorCode, SettldError};

/// `CompletionReceipt.v1` wire shape.
pub const COMPLETION_RECEIPT: ArtifactSpec = ArtifactSpec {
    name: "CompletionReceipt",
    version: 1,
    hash_field: "receiptHash",
    core_field: "receiptCore",
};

/// `WorkOrderMeteringSnapshot.v1` wire shape.
pub const METERING_SNAPSHOT: ArtifactSpec = ArtifactSpec {
    name: "WorkOrderMeteringSnapshot",
    version: 1,
    hash_field: "snapshotHash",
    core_field: "snapshotCore",
};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle of a work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    /// Declared, not yet accepted by the provider.
    Created,
    /// Accepted by the provider.
    Accepted,
    /// Execution underway.
    InProgress,
    /// Work finished; completion receipt emitted.
    Completed,
    /// Settled against the paying gate.
    Settled,
    /// Failed terminally.
    Failed,
}

impl WorkOrderStatus {
    /// Valid successor states.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [WorkOrderStatus] {
        match self {
            Self::Created => &[Self::Accepted, Self::Failed],
            Self::Accepted => &[Self::InProgress, Self::Failed],
            Self::InProgress => &[Self::Completed, Self::Failed],
            Self::Completed => &[Self::Settled, Self::Failed],
            Self::Settled | Self::Failed => &[],
        }
    }

    /// Returns `true` if `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: WorkOrderStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// One metering increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meter {
    /// Top-up id, unique per work order.
    pub top_up_id: String,
    /// Billable event key, unique per work order.
    pub event_key: String,
    /// Amount in cents.
    pub amount_cents: i64,
    /// Quantity metered.
    pub quantity: u64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// When the billable event occurred.
    pub occurred_at: String,
}

/// A top-up request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopUp {
    /// Top-up id.
    pub top_up_id: String,
    /// Billable event key.
    pub event_key: String,
    /// Amount in cents.
    pub amount_cents: i64,
    /// Quantity metered.
    pub quantity: u64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// When the billable event occurred.
    pub occurred_at: String,
}

/// Derived metering figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrderMetering {
    /// Declared base amount in cents.
    pub base_amount_cents: i64,
    /// Sum of all top-ups in cents.
    pub top_up_total_cents: i64,
    /// `base + top-ups`.
    pub covered_amount_cents: i64,
    /// `max(0, maxCost − covered)`.
    pub remaining_cents: i64,
    /// `sha256(canonical([meter1Hash, …, meterNHash]))`.
    pub meter_digest: String,
}

/// A work order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrder {
    /// Work order id (`workord_…`).
    pub work_order_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Human description of the work.
    pub title: String,
    /// Paying agent.
    pub payer_agent_id: String,
    /// Performing agent.
    pub payee_agent_id: String,
    /// Declared base amount in cents.
    pub base_amount_cents: i64,
    /// Hard cost cap in cents.
    pub max_cost_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Current status.
    pub status: WorkOrderStatus,
    /// Ordered meters.
    pub meters: Vec<Meter>,
    /// The paying x402 gate, once bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x402_gate_id: Option<String>,
    /// The paid run, once bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x402_run_id: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
}

impl WorkOrder {
    /// Create a work order in `created`.
    ///
    /// # Errors
    ///
    /// `SCHEMA_INVALID` for negative amounts or a cap below the base.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: &str,
        title: &str,
        payer_agent_id: &str,
        payee_agent_id: &str,
        base_amount_cents: i64,
        max_cost_cents: i64,
        currency: &str,
        created_at: &str,
    ) -> Result<Self, SettldError> {
        if base_amount_cents < 0 || max_cost_cents < base_amount_cents {
            return Err(SettldError::new(
                ErrorCode::SchemaInvalid,
                "maxCostCents must be >= baseAmountCents >= 0",
            )
            .with_detail("baseAmountCents", base_amount_cents)
            .with_detail("maxCostCents", max_cost_cents));
        }
        Ok(Self {
            work_order_id: new_id(IdPrefix::WorkOrder),
            tenant_id: tenant_id.to_string(),
            title: title.to_string(),
            payer_agent_id: payer_agent_id.to_string(),
            payee_agent_id: payee_agent_id.to_string(),
            base_amount_cents,
            max_cost_cents,
            currency: currency.to_string(),
            status: WorkOrderStatus::Created,
            meters: vec![],
            x402_gate_id: None,
            x402_run_id: None,
            created_at: created_at.to_string(),
        })
    }

    /// Advance the status.
    ///
    /// # Errors
    ///
    /// `SCHEMA_INVALID` on an illegal transition.
    pub fn transition(&mut self, next: WorkOrderStatus) -> Result<(), SettldError> {
        if !self.status.can_transition_to(next) {
            return Err(
                SettldError::new(ErrorCode::SchemaInvalid, "invalid work order transition")
                    .with_detail("from", format!("{:?}", self.status))
                    .with_detail("to", format!("{next:?}")),
            );
        }
        self.status = next;
        Ok(())
    }

    /// Apply a top-up, appending one meter.
    ///
    /// Validation happens before any mutation: a duplicate `topUpId` or
    /// `eventKey`, a mismatched currency, or a non-positive amount leaves the
    /// order untouched.
    ///
    /// # Errors
    ///
    /// `SCHEMA_INVALID`, with the offending field in the details.
    pub fn apply_top_up(&mut self, top_up: &TopUp) -> Result<(), SettldError> {
        if top_up.amount_cents <= 0 {
            return Err(
                SettldError::new(ErrorCode::SchemaInvalid, "top-up amount must be positive")
                    .with_detail("amountCents", top_up.amount_cents),
            );
        }
        if top_up.currency != self.currency {
            return Err(
                SettldError::new(ErrorCode::SchemaInvalid, "top-up currency mismatch")
                    .with_detail("expected", self.currency.clone())
                    .with_detail("actual", top_up.currency.clone()),
            );
        }
        if self.meters.iter().any(|m| m.top_up_id == top_up.top_up_id) {
            return Err(SettldError::new(ErrorCode::SchemaInvalid, "duplicate topUpId")
                .with_detail("topUpId", top_up.top_up_id.clone()));
        }
        if self.meters.iter().any(|m| m.event_key == top_up.event_key) {
            return Err(SettldError::new(ErrorCode::SchemaInvalid, "duplicate eventKey")
                .with_detail("eventKey", top_up.event_key.clone()));
        }
        self.meters.push(Meter {
            top_up_id: top_up.top_up_id.clone(),
            event_key: top_up.event_key.clone(),
            amount_cents: top_up.amount_cents,
            quantity: top_up.quantity,
            currency: top_up.currency.clone(),
            occurred_at: top_up.occurred_at.clone(),
        });
        Ok(())
    }

    /// Compute the derived metering figures.
    ///
    /// # Errors
    ///
    /// Internal canonicalization failure only.
    pub fn metering(&self) -> Result<WorkOrderMetering, SettldError> {
        let mut meter_hashes = Vec::with_capacity(self.meters.len());
        for meter in &self.meters {
            meter_hashes.push(
                canonical_hash(meter)
                    .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?,
            );
        }
        let digest_input = settld_canon::canonical_string(&meter_hashes)
            .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;
        let top_up_total_cents: i64 = self.meters.iter().map(|m| m.amount_cents).sum();
        let covered_amount_cents = self.base_amount_cents + top_up_total_cents;
        Ok(WorkOrderMetering {
            base_amount_cents: self.base_amount_cents,
            top_up_total_cents,
            covered_amount_cents,
            remaining_cents: (self.max_cost_cents - covered_amount_cents).max(0),
            meter_digest: sha256_hex(digest_input.as_bytes()),
        })
    }

    /// Move to `completed` and emit the sealed `CompletionReceipt.v1`.
    ///
    /// # Errors
    ///
    /// `SCHEMA_INVALID` on an illegal transition, or when the gate/run
    /// binding is missing.
    pub fn complete(
        &mut self,
        evidence_refs: Vec<String>,
        generated_at: &str,
    ) -> Result<Value, SettldError> {
        let (Some(gate_id), Some(run_id)) = (&self.x402_gate_id, &self.x402_run_id) else {
            return Err(SettldError::new(
                ErrorCode::SchemaInvalid,
                "completion requires x402 gate and run bindings",
            ));
        };
        let gate_id = gate_id.clone();
        let run_id = run_id.clone();
        let metering = self.metering()?;
        self.transition(WorkOrderStatus::Completed)?;
        let core = json!({
            "receiptId": new_id(IdPrefix::Receipt),
            "workOrderId": self.work_order_id,
            "tenantId": self.tenant_id,
            "meterDigest": metering.meter_digest,
            "coveredAmountCents": metering.covered_amount_cents,
            "currency": self.currency,
            "evidenceRefs": evidence_refs,
            "x402GateId": gate_id,
            "x402RunId": run_id,
        });
        seal(&COMPLETION_RECEIPT, &core, generated_at)
            .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))
    }

    /// Move to `settled`, checking the released amount against the covered
    /// amount.
    ///
    /// # Errors
    ///
    /// `SCHEMA_INVALID` when the amounts disagree or the transition is
    /// illegal.
    pub fn settle(&mut self, released_amount_cents: i64) -> Result<(), SettldError> {
        let metering = self.metering()?;
        if released_amount_cents != metering.covered_amount_cents {
            return Err(SettldError::new(
                ErrorCode::SchemaInvalid,
                "released amount does not match the covered work-order amount",
            )
            .with_detail("releasedAmountCents", released_amount_cents)
            .with_detail("coveredAmountCents", metering.covered_amount_cents));
        }
        self.transition(WorkOrderStatus::Settled)
    }

    /// Build a sealed `WorkOrderMeteringSnapshot.v1`.
    ///
    /// # Errors
    ///
    /// Internal canonicalization failure only.
    pub fn metering_snapshot(&self, generated_at: &str) -> Result<Value, SettldError> {
        let metering = self.metering()?;
        let core = json!({
            "workOrderId": self.work_order_id,
            "tenantId": self.tenant_id,
            "status": self.status,
            "metering": metering,
            "meters": self.meters,
        });
        seal(&METERING_SNAPSHOT, &core, generated_at)
            .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verify a `CompletionReceipt.v1`, optionally against its work order.
#[must_use]
pub fn verify_completion_receipt(artifact: &Value, work_order: Option<&WorkOrder>) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&COMPLETION_RECEIPT, artifact, &mut report) else {
        return report;
    };
    let Some(order) = work_order else {
        return report;
    };
    match order.metering() {
        Ok(metering) => {
            if core.get("meterDigest").and_then(Value::as_str)
                != Some(metering.meter_digest.as_str())
            {
                report.error_code(
                    ErrorCode::CrossArtifactBindingMismatch,
                    "receiptCore.meterDigest",
                    "receipt digest does not match the work order meters",
                );
            }
            if core.get("coveredAmountCents").and_then(Value::as_i64)
                != Some(metering.covered_amount_cents)
            {
                report.error_code(
                    ErrorCode::SchemaInvalid,
                    "receiptCore.coveredAmountCents",
                    "covered amount does not match the work order",
                );
            }
        }
        Err(e) => report.error_code(ErrorCode::Internal, "workOrder", e.to_string()),
    }
    report
}

/// Verify a `WorkOrderMeteringSnapshot.v1`: seal plus arithmetic recompute.
#[must_use]
pub fn verify_metering_snapshot(artifact: &Value) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&METERING_SNAPSHOT, artifact, &mut report) else {
        return report;
    };
    let meters: Vec<Meter> = match core.get("meters").cloned().map(serde_json::from_value) {
        Some(Ok(meters)) => meters,
        _ => {
            report.error_code(ErrorCode::SchemaInvalid, "snapshotCore.meters", "meters not parseable");
            return report;
        }
    };
    let declared_total = core
        .pointer("/metering/topUpTotalCents")
        .and_then(Value::as_i64);
    let actual_total: i64 = meters.iter().map(|m| m.amount_cents).sum();
    if declared_total != Some(actual_total) {
        report.error_code(
            ErrorCode::SchemaInvalid,
            "snapshotCore.metering.topUpTotalCents",
            format!("declared {declared_total:?} but meters sum to {actual_total}"),
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    const AT: &str = "2026-02-02T00:00:00.000Z";

    fn order() -> WorkOrder {
        WorkOrder::new(
            "tenant-a",
            "index the corpus",
            "agt_payer",
            "agt_payee",
            1_000,
            5_000,
            "USD",
            AT,
        )
        .unwrap()
    }

    fn top_up(id: &str, key: &str, amount: i64) -> TopUp {
        TopUp {
            top_up_id: id.to_string(),
            event_key: key.to_string(),
            amount_cents: amount,
            quantity: 1,
            currency: "USD".to_string(),
            occurred_at: AT.to_string(),
        }
    }

    #[test]
    fn metering_arithmetic_holds() {
        let mut order = order();
        order.apply_top_up(&top_up("t1", "k1", 500)).unwrap();
        order.apply_top_up(&top_up("t2", "k2", 700)).unwrap();
        let metering = order.metering().unwrap();
        assert_eq!(metering.top_up_total_cents, 1_200);
        assert_eq!(metering.covered_amount_cents, 2_200);
        assert_eq!(metering.remaining_cents, 2_800);
        assert_eq!(metering.meter_digest.len(), 64);
    }

    #[test]
    fn remaining_clamps_at_zero() {
        let mut order = order();
        order.apply_top_up(&top_up("t1", "k1", 4_500)).unwrap();
        assert_eq!(order.metering().unwrap().remaining_cents, 0);
    }

    #[test]
    fn duplicate_top_up_id_is_rejected_without_mutation() {
        let mut order = order();
        order.apply_top_up(&top_up("t1", "k1", 500)).unwrap();
        let err = order.apply_top_up(&top_up("t1", "k2", 100)).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaInvalid);
        let err = order.apply_top_up(&top_up("t2", "k1", 100)).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaInvalid);
        assert_eq!(order.meters.len(), 1);
    }

    #[test]
    fn meter_digest_tracks_order_and_content() {
        let mut a = order();
        a.apply_top_up(&top_up("t1", "k1", 500)).unwrap();
        a.apply_top_up(&top_up("t2", "k2", 700)).unwrap();
        let mut b = order();
        b.apply_top_up(&top_up("t2", "k2", 700)).unwrap();
        b.apply_top_up(&top_up("t1", "k1", 500)).unwrap();
        assert_ne!(
            a.metering().unwrap().meter_digest,
            b.metering().unwrap().meter_digest
        );
    }

    #[test]
    fn lifecycle_transitions_are_guarded() {
        let mut order = order();
        assert!(order.transition(WorkOrderStatus::InProgress).is_err());
        order.transition(WorkOrderStatus::Accepted).unwrap();
        order.transition(WorkOrderStatus::InProgress).unwrap();
        assert_eq!(order.status, WorkOrderStatus::InProgress);
        assert!(WorkOrderStatus::Settled.valid_transitions().is_empty());
    }

    #[test]
    fn completion_emits_bound_receipt() {
        let mut order = order();
        order.x402_gate_id = Some("gate_1".into());
        order.x402_run_id = Some("run_1".into());
        order.transition(WorkOrderStatus::Accepted).unwrap();
        order.transition(WorkOrderStatus::InProgress).unwrap();
        order.apply_top_up(&top_up("t1", "k1", 500)).unwrap();

        let receipt = order
            .complete(vec![format!("http:request_sha256:{}", "a".repeat(64))], AT)
            .unwrap();
        assert_eq!(order.status, WorkOrderStatus::Completed);
        assert!(verify_completion_receipt(&receipt, Some(&order)).ok);
        assert_eq!(receipt["receiptCore"]["x402GateId"], "gate_1");
        assert_eq!(receipt["receiptCore"]["coveredAmountCents"], 1_500);

        // A later top-up breaks the digest binding.
        order.apply_top_up(&top_up("t2", "k2", 100)).unwrap();
        let report = verify_completion_receipt(&receipt, Some(&order));
        assert!(report
            .error_codes()
            .contains(&"CROSS_ARTIFACT_BINDING_MISMATCH".to_string()));
    }

    #[test]
    fn completion_without_gate_binding_is_rejected() {
        let mut order = order();
        order.transition(WorkOrderStatus::Accepted).unwrap();
        order.transition(WorkOrderStatus::InProgress).unwrap();
        assert!(order.complete(vec![], AT).is_err());
        assert_eq!(order.status, WorkOrderStatus::InProgress);
    }

    #[test]
    fn settle_requires_matching_release() {
        let mut order = order();
        order.x402_gate_id = Some("gate_1".into());
        order.x402_run_id = Some("run_1".into());
        order.transition(WorkOrderStatus::Accepted).unwrap();
        order.transition(WorkOrderStatus::InProgress).unwrap();
        order.complete(vec![], AT).unwrap();

        let err = order.settle(999).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaInvalid);
        assert_eq!(order.status, WorkOrderStatus::Completed);

        order.settle(1_000).unwrap();
        assert_eq!(order.status, WorkOrderStatus::Settled);
    }

    #[test]
    fn metering_snapshot_roundtrip() {
        let mut order = order();
        order.apply_top_up(&top_up("t1", "k1", 500)).unwrap();
        let snapshot = order.metering_snapshot(AT).unwrap();
        assert!(verify_metering_snapshot(&snapshot).ok);

        let mut tampered = snapshot.clone();
        tampered["snapshotCore"]["metering"]["topUpTotalCents"] = json!(1);
        tampered["snapshotHash"] =
            json!(canonical_hash(&tampered["snapshotCore"]).unwrap());
        let report = verify_metering_snapshot(&tampered);
        assert_eq!(report.error_codes(), vec!["SCHEMA_INVALID"]);
    }
}
