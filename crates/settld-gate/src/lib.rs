// SPDX-License-Identifier: MIT OR Apache-2.0
//! The x402 payment gate.
//!
//! A gate is a payment intent that moves through
//! `created → authorized → resolved{released|refunded|split}` (plus a signed
//! reversal path). State only mutates through the transition functions in
//! this crate; every resolution satisfies
//! `released + refunded == authorized amount`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Participant lifecycle and signer-key gates.
pub mod lifecycle;
/// Signed reversal commands.
pub mod reversal;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use settld_artifact::{seal, ArtifactSpec, Report};
use settld_canon::ids::{new_id, IdPrefix};
use settld_canon::{canonical_string, is_hex_digest};
use settld_crypto::verify_detached_pem;
use settld_error::{ErrorCode, SettldError};

pub use lifecycle::{
    ensure_participant_active, ensure_signer_key_active, AgentLifecycle, SignerKeyStatus,
};
pub use reversal::{apply_reversal, ReversalCommand, ReversalTarget};

/// `X402SettlementReceipt.v1` wire shape.
pub const SETTLEMENT_RECEIPT: ArtifactSpec = ArtifactSpec {
    name: "X402SettlementReceipt",
    version: 1,
    hash_field: "receiptHash",
    core_field: "receiptCore",
};

/// `X402DecisionTrace.v1` wire shape.
pub const DECISION_TRACE: ArtifactSpec = ArtifactSpec {
    name: "X402DecisionTrace",
    version: 1,
    hash_field: "traceHash",
    core_field: "traceCore",
};

// ---------------------------------------------------------------------------
// Gate model
// ---------------------------------------------------------------------------

/// Lifecycle state of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// Intent recorded; funds not yet authorized.
    Created,
    /// Funds authorized and held.
    Authorized,
    /// Settled; see [`GateDecision`].
    Resolved,
    /// Settlement reversed by a signed command.
    Reversed,
}

impl GateState {
    /// Valid successor states.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [GateState] {
        match self {
            Self::Created => &[Self::Authorized],
            Self::Authorized => &[Self::Resolved],
            Self::Resolved => &[Self::Reversed],
            Self::Reversed => &[],
        }
    }

    /// Returns `true` if `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: GateState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// How a resolution splits the authorized amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    /// Full amount released to the payee.
    Released,
    /// Full amount refunded to the payer.
    Refunded,
    /// Partial release, remainder refunded.
    Split,
}

/// Terminal status of the paid-for run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run finished.
    Completed,
    /// The run failed.
    Failed,
}

/// Verification color reported for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationColor {
    /// Verified clean.
    Green,
    /// Verified with findings.
    Amber,
    /// Verification failed.
    Red,
}

/// Economic terms of a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateTerms {
    /// Paying agent.
    pub payer_agent_id: String,
    /// Paid agent.
    pub payee_agent_id: String,
    /// Authorized amount in cents.
    pub amount_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
}

/// Per-color conditional release policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleasePolicy {
    /// Auto-release on a green verification.
    pub auto_release_on_green: bool,
    /// Release rate for green, percent 0–100.
    pub green_release_rate_pct: u8,
    /// Auto-release on an amber verification.
    pub auto_release_on_amber: bool,
    /// Release rate for amber, percent 0–100.
    pub amber_release_rate_pct: u8,
    /// Auto-release on a red verification.
    pub auto_release_on_red: bool,
    /// Release rate for red, percent 0–100.
    pub red_release_rate_pct: u8,
    /// Cap on any auto-released amount, in cents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_auto_release_amount_cents: Option<i64>,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            auto_release_on_green: true,
            green_release_rate_pct: 100,
            auto_release_on_amber: false,
            amber_release_rate_pct: 0,
            auto_release_on_red: false,
            red_release_rate_pct: 0,
            max_auto_release_amount_cents: None,
        }
    }
}

impl ReleasePolicy {
    /// Whether auto-release applies and at what rate, per color.
    #[must_use]
    pub fn rate_for(&self, color: VerificationColor) -> Option<u8> {
        let (enabled, pct) = match color {
            VerificationColor::Green => (self.auto_release_on_green, self.green_release_rate_pct),
            VerificationColor::Amber => (self.auto_release_on_amber, self.amber_release_rate_pct),
            VerificationColor::Red => (self.auto_release_on_red, self.red_release_rate_pct),
        };
        enabled.then_some(pct.min(100))
    }

    /// Reject out-of-range rates.
    ///
    /// # Errors
    ///
    /// Returns a `SCHEMA_INVALID` error naming the offending field.
    pub fn validate(&self) -> Result<(), SettldError> {
        for (field, pct) in [
            ("greenReleaseRatePct", self.green_release_rate_pct),
            ("amberReleaseRatePct", self.amber_release_rate_pct),
            ("redReleaseRatePct", self.red_release_rate_pct),
        ] {
            if pct > 100 {
                return Err(
                    SettldError::new(ErrorCode::SchemaInvalid, "release rate out of range")
                        .with_detail("field", field)
                        .with_detail("value", pct),
                );
            }
        }
        Ok(())
    }
}

/// The settlement split and its reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    /// Decision id.
    pub decision_id: String,
    /// Amount released to the payee, in cents.
    pub released_amount_cents: i64,
    /// Amount refunded to the payer, in cents.
    pub refunded_amount_cents: i64,
    /// Resolution kind.
    pub resolution: ResolutionKind,
    /// Machine-readable reasons, in evaluation order.
    pub reason_codes: Vec<String>,
}

/// A payment gate record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X402Gate {
    /// Gate id (`gate_…`).
    pub gate_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Economic terms.
    pub terms: GateTerms,
    /// Conditional release policy.
    pub policy: ReleasePolicy,
    /// Pinned provider attestation key. When set, only this key may attest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_public_key_pem: Option<String>,
    /// Current state.
    pub state: GateState,
    /// Run this gate pays for, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Authorization timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_at: Option<String>,
    /// Resolution timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
    /// Resolution decision, once resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<GateDecision>,
}

/// Create a gate in `created`.
///
/// # Errors
///
/// Returns `SCHEMA_INVALID` for a non-positive amount or an out-of-range
/// policy rate.
pub fn create_gate(
    tenant_id: &str,
    terms: GateTerms,
    policy: ReleasePolicy,
    provider_public_key_pem: Option<String>,
    created_at: &str,
) -> Result<X402Gate, SettldError> {
    if terms.amount_cents <= 0 {
        return Err(
            SettldError::new(ErrorCode::SchemaInvalid, "amountCents must be positive")
                .with_detail("amountCents", terms.amount_cents),
        );
    }
    policy.validate()?;
    Ok(X402Gate {
        gate_id: new_id(IdPrefix::Gate),
        tenant_id: tenant_id.to_string(),
        terms,
        policy,
        provider_public_key_pem,
        state: GateState::Created,
        run_id: None,
        created_at: created_at.to_string(),
        authorized_at: None,
        resolved_at: None,
        decision: None,
    })
}

/// Move `created → authorized`, binding the run id.
///
/// # Errors
///
/// Returns `SCHEMA_INVALID` on an illegal transition.
pub fn authorize_payment(
    gate: &mut X402Gate,
    run_id: &str,
    at: &str,
) -> Result<(), SettldError> {
    if !gate.state.can_transition_to(GateState::Authorized) {
        return Err(invalid_transition(gate.state, GateState::Authorized));
    }
    gate.state = GateState::Authorized;
    gate.run_id = Some(run_id.to_string());
    gate.authorized_at = Some(at.to_string());
    Ok(())
}

fn invalid_transition(from: GateState, to: GateState) -> SettldError {
    SettldError::new(ErrorCode::SchemaInvalid, "invalid gate transition")
        .with_detail("from", format!("{from:?}"))
        .with_detail("to", format!("{to:?}"))
}

// ---------------------------------------------------------------------------
// Verify input
// ---------------------------------------------------------------------------

/// Signed provider attestation over `{responseHash, nonce, signedAt}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAttestation {
    /// Hash of the provider's response body.
    pub response_hash: String,
    /// One-time nonce.
    pub nonce: String,
    /// Signing timestamp.
    pub signed_at: String,
    /// Detached base64 signature.
    pub signature: String,
    /// Key the caller claims signed this. Ignored whenever the gate pins a
    /// provider key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,
}

impl ProviderAttestation {
    /// Canonical bytes the attestation signature covers.
    ///
    /// # Errors
    ///
    /// Returns [`settld_canon::CanonError`] on serialization failure.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, settld_canon::CanonError> {
        let body = json!({
            "responseHash": self.response_hash,
            "nonce": self.nonce,
            "signedAt": self.signed_at,
        });
        Ok(canonical_string(&body)?.into_bytes())
    }
}

/// How the run outcome was verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    /// Outcome observed through a captured HTTP request.
    HttpRequest,
    /// Outcome attested by the provider.
    ProviderAttestation,
}

/// Input to [`verify_gate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyInput {
    /// Terminal run status.
    pub run_status: RunStatus,
    /// Reported verification color.
    pub verification_status: VerificationColor,
    /// Verification method.
    pub method: VerificationMethod,
    /// Evidence references. For [`VerificationMethod::HttpRequest`], exactly
    /// one `http:request_sha256:<64hex>` ref is required.
    pub evidence_refs: Vec<String>,
    /// Provider attestation, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<ProviderAttestation>,
}

/// Output of [`verify_gate`]: the updated gate plus its two artifacts.
#[derive(Debug, Clone)]
pub struct Settlement {
    /// The sealed `X402SettlementReceipt.v1`.
    pub receipt: Value,
    /// Receipt id (`rcpt_…`).
    pub receipt_id: String,
    /// The sealed `X402DecisionTrace.v1`.
    pub decision_trace: Value,
}

const HTTP_EVIDENCE_PREFIX: &str = "http:request_sha256:";

fn http_evidence_hash(evidence_ref: &str) -> Option<&str> {
    evidence_ref
        .strip_prefix(HTTP_EVIDENCE_PREFIX)
        .filter(|h| is_hex_digest(h))
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

/// Verify a run outcome against the gate's policy and resolve the gate.
///
/// Steps, in order: transition guard, evidence binding, pinned-key
/// attestation check (failure forces red), policy evaluation, decision
/// assembly, receipt + trace emission.
///
/// # Errors
///
/// Returns typed errors for illegal transitions and evidence-binding
/// failures; attestation failures do NOT error — they force a red
/// resolution with `X402_PROVIDER_SIGNATURE_INVALID` in the reasons.
pub fn verify_gate(
    gate: &mut X402Gate,
    input: &VerifyInput,
    at: &str,
) -> Result<Settlement, SettldError> {
    if !gate.state.can_transition_to(GateState::Resolved) {
        return Err(invalid_transition(gate.state, GateState::Resolved));
    }

    let mut trace: Vec<Value> = Vec::new();
    let mut reason_codes: Vec<String> = Vec::new();

    // Evidence binding is checked before any economics.
    if input.method == VerificationMethod::HttpRequest {
        let bound: Vec<&str> = input
            .evidence_refs
            .iter()
            .filter_map(|r| http_evidence_hash(r))
            .collect();
        match bound.len() {
            0 => {
                return Err(SettldError::new(
                    ErrorCode::X402ReversalBindingEvidenceRequired,
                    "http_request verification requires exactly one http:request_sha256 evidence ref",
                ))
            }
            1 => {
                trace.push(json!({
                    "step": "evidence_binding",
                    "detail": {"requestSha256": bound[0]},
                }));
            }
            _ => {
                return Err(SettldError::new(
                    ErrorCode::X402ReversalBindingEvidenceMismatch,
                    "conflicting http:request_sha256 evidence refs",
                )
                .with_detail("count", bound.len()))
            }
        }
    }

    // Pinned provider key: the supplied key is never consulted.
    let mut effective_color = input.verification_status;
    if let Some(pinned_pem) = gate.provider_public_key_pem.as_deref() {
        let attested = input.attestation.as_ref().is_some_and(|att| {
            att.signed_bytes()
                .map(|bytes| verify_detached_pem(&bytes, &att.signature, pinned_pem))
                .unwrap_or(false)
        });
        if attested {
            trace.push(json!({"step": "provider_signature", "detail": {"ok": true}}));
        } else {
            effective_color = VerificationColor::Red;
            reason_codes.push(ErrorCode::X402ProviderSignatureInvalid.as_str().to_string());
            trace.push(json!({
                "step": "provider_signature",
                "detail": {"ok": false, "forcedStatus": "red"},
            }));
        }
    }

    // Policy evaluation.
    let amount = gate.terms.amount_cents;
    let mut released = match gate.policy.rate_for(effective_color) {
        Some(pct) => {
            reason_codes.push(format!(
                "AUTO_RELEASE_{}",
                color_tag(effective_color).to_uppercase()
            ));
            // Round half-up in integer cents.
            (amount * i64::from(pct) + 50) / 100
        }
        None => {
            reason_codes.push("AUTO_RELEASE_DISABLED".to_string());
            0
        }
    };
    if let Some(cap) = gate.policy.max_auto_release_amount_cents
        && released > cap
    {
        released = cap;
        reason_codes.push("RELEASE_CAP_APPLIED".to_string());
    }
    let refunded = amount - released;
    trace.push(json!({
        "step": "policy",
        "detail": {
            "effectiveStatus": color_tag(effective_color),
            "releasedAmountCents": released,
            "refundedAmountCents": refunded,
        },
    }));

    let resolution = if released == amount {
        ResolutionKind::Released
    } else if released == 0 {
        ResolutionKind::Refunded
    } else {
        ResolutionKind::Split
    };

    let decision = GateDecision {
        decision_id: new_id(IdPrefix::Gate),
        released_amount_cents: released,
        refunded_amount_cents: refunded,
        resolution,
        reason_codes: reason_codes.clone(),
    };

    // Receipt + trace artifacts.
    let receipt_id = new_id(IdPrefix::Receipt);
    let receipt_core = json!({
        "receiptId": receipt_id,
        "gateId": gate.gate_id,
        "tenantId": gate.tenant_id,
        "runId": gate.run_id,
        "runStatus": input.run_status,
        "verificationStatus": effective_color,
        "amountCents": amount,
        "currency": gate.terms.currency,
        "releasedAmountCents": released,
        "refundedAmountCents": refunded,
        "resolution": resolution,
        "decisionRef": {
            "decisionId": decision.decision_id,
            "reasonCodes": reason_codes,
        },
        "evidenceRefs": input.evidence_refs,
    });
    let receipt = seal(&SETTLEMENT_RECEIPT, &receipt_core, at)
        .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;

    let trace_core = json!({
        "decisionId": decision.decision_id,
        "gateId": gate.gate_id,
        "steps": trace,
    });
    let decision_trace = seal(&DECISION_TRACE, &trace_core, at)
        .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;

    gate.state = GateState::Resolved;
    gate.resolved_at = Some(at.to_string());
    gate.decision = Some(decision);

    Ok(Settlement {
        receipt,
        receipt_id,
        decision_trace,
    })
}

fn color_tag(color: VerificationColor) -> &'static str {
    match color {
        VerificationColor::Green => "green",
        VerificationColor::Amber => "amber",
        VerificationColor::Red => "red",
    }
}

// ---------------------------------------------------------------------------
// Receipt verification
// ---------------------------------------------------------------------------

/// Verify a settlement receipt artifact: seal plus decision arithmetic.
#[must_use]
pub fn verify_settlement_receipt(artifact: &Value) -> Report {
    let mut report = Report::new();
    let Some(core) = settld_artifact::verify_seal(&SETTLEMENT_RECEIPT, artifact, &mut report)
    else {
        return report;
    };
    let amount = core.get("amountCents").and_then(Value::as_i64);
    let released = core.get("releasedAmountCents").and_then(Value::as_i64);
    let refunded = core.get("refundedAmountCents").and_then(Value::as_i64);
    match (amount, released, refunded) {
        (Some(a), Some(rel), Some(ref_)) if rel + ref_ == a && rel >= 0 && ref_ >= 0 => {}
        _ => {
            report.error_code(
                ErrorCode::SchemaInvalid,
                "receiptCore.releasedAmountCents",
                "released + refunded must equal amountCents",
            );
        }
    }
    report
}
