// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed reversal commands.
//!
//! A resolved gate may be reversed by a command signed by a trusted buyer
//! decision key. The command binds the gate, the settlement receipt, and
//! (when the settlement was evidence-bound) the captured request hash;
//! any mismatch fails closed with a typed code and mutates nothing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use settld_canon::canonical_string;
use settld_crypto::{TrustRole, TrustStore};
use settld_error::{ErrorCode, SettldError};

use crate::{GateDecision, GateState, ResolutionKind, X402Gate};

/// What a reversal command targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalTarget {
    /// The gate being reversed.
    pub gate_id: String,
    /// The settlement receipt being reversed.
    pub receipt_id: String,
    /// Optional quote binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote_id: Option<String>,
    /// Captured request hash, required when the settlement carried
    /// `http:request_sha256` evidence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_sha256: Option<String>,
}

/// A signed reversal command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalCommand {
    /// Command id.
    pub command_id: String,
    /// Sponsoring account or program.
    pub sponsor_ref: String,
    /// Key id the command is signed with.
    pub agent_key_id: String,
    /// Binding target.
    pub target: ReversalTarget,
    /// Action tag (`"reverse_release"`).
    pub action: String,
    /// One-time nonce.
    pub nonce: String,
    /// Idempotency key for replays.
    pub idempotency_key: String,
    /// RFC-3339 expiry.
    pub exp: String,
}

impl ReversalCommand {
    /// Canonical bytes the command signature covers.
    ///
    /// # Errors
    ///
    /// Returns [`settld_canon::CanonError`] on serialization failure.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, settld_canon::CanonError> {
        Ok(canonical_string(self)?.into_bytes())
    }
}

/// Evidence context extracted from the settlement receipt.
fn receipt_request_hash(receipt: &Value) -> Option<String> {
    receipt
        .get("receiptCore")?
        .get("evidenceRefs")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .find_map(|r| r.strip_prefix("http:request_sha256:"))
        .map(str::to_string)
}

/// Apply a signed reversal to a resolved gate.
///
/// Checks, fail-closed and in order: state, expiry, signature against the
/// buyer-decision trust role, target binding (gate, receipt, request hash).
/// On success the decision flips: everything released is refunded.
///
/// # Errors
///
/// Typed: `SCHEMA_INVALID` (state/expiry), `SIGNER_NOT_TRUSTED`,
/// `X402_REVERSAL_BINDING_EVIDENCE_REQUIRED` / `…_MISMATCH`.
pub fn apply_reversal(
    gate: &mut X402Gate,
    receipt: &Value,
    receipt_id: &str,
    command: &ReversalCommand,
    signature_b64: &str,
    trust: &TrustStore,
    now: &str,
) -> Result<GateDecision, SettldError> {
    if !gate.state.can_transition_to(GateState::Reversed) {
        return Err(
            SettldError::new(ErrorCode::SchemaInvalid, "gate is not reversible")
                .with_detail("state", format!("{:?}", gate.state)),
        );
    }
    if command.exp.as_str() <= now {
        return Err(
            SettldError::new(ErrorCode::SchemaInvalid, "reversal command expired")
                .with_detail("exp", command.exp.clone()),
        );
    }

    let bytes = command
        .signed_bytes()
        .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;
    trust
        .verify_role(
            &bytes,
            signature_b64,
            &command.agent_key_id,
            TrustRole::BuyerDecisionSigners,
        )
        .map_err(|e| {
            SettldError::new(ErrorCode::SignerNotTrusted, e.to_string())
                .with_detail("signerKeyId", command.agent_key_id.clone())
        })?;

    if command.target.gate_id != gate.gate_id || command.target.receipt_id != receipt_id {
        return Err(SettldError::new(
            ErrorCode::X402ReversalBindingEvidenceMismatch,
            "command target does not match gate or receipt",
        )
        .with_detail("targetGateId", command.target.gate_id.clone())
        .with_detail("targetReceiptId", command.target.receipt_id.clone()));
    }

    // When the settlement carried request evidence, the command must carry
    // the same hash.
    if let Some(bound_hash) = receipt_request_hash(receipt) {
        match command.target.request_sha256.as_deref() {
            None => {
                return Err(SettldError::new(
                    ErrorCode::X402ReversalBindingEvidenceRequired,
                    "settlement is evidence-bound; command must carry requestSha256",
                ))
            }
            Some(given) if given != bound_hash => {
                return Err(SettldError::new(
                    ErrorCode::X402ReversalBindingEvidenceMismatch,
                    "command requestSha256 does not match settlement evidence",
                )
                .with_detail("expected", bound_hash)
                .with_detail("actual", given))
            }
            Some(_) => {}
        }
    }

    let prior = gate
        .decision
        .clone()
        .ok_or_else(|| SettldError::new(ErrorCode::Internal, "resolved gate has no decision"))?;

    let reversed = GateDecision {
        decision_id: settld_canon::ids::new_id(settld_canon::ids::IdPrefix::Gate),
        released_amount_cents: 0,
        refunded_amount_cents: gate.terms.amount_cents,
        resolution: ResolutionKind::Refunded,
        reason_codes: {
            let mut reasons = vec![format!("REVERSED_BY:{}", command.command_id)];
            reasons.extend(prior.reason_codes.iter().cloned());
            reasons
        },
    };
    gate.state = GateState::Reversed;
    gate.decision = Some(reversed.clone());
    Ok(reversed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authorize_payment, create_gate, verify_gate, GateTerms, ReleasePolicy, RunStatus,
        VerificationColor, VerificationMethod, VerifyInput,
    };
    use settld_crypto::Keypair;

    const AT: &str = "2026-02-02T00:00:00.000Z";
    const EXP: &str = "2027-01-01T00:00:00.000Z";

    fn resolved_gate() -> (X402Gate, Value, String) {
        let mut gate = create_gate(
            "tenant-a",
            GateTerms {
                payer_agent_id: "agt_payer".into(),
                payee_agent_id: "agt_payee".into(),
                amount_cents: 500,
                currency: "USD".into(),
            },
            ReleasePolicy::default(),
            None,
            AT,
        )
        .unwrap();
        authorize_payment(&mut gate, "run-1", AT).unwrap();
        let settlement = verify_gate(
            &mut gate,
            &VerifyInput {
                run_status: RunStatus::Completed,
                verification_status: VerificationColor::Green,
                method: VerificationMethod::HttpRequest,
                evidence_refs: vec![format!("http:request_sha256:{}", "a".repeat(64))],
                attestation: None,
            },
            AT,
        )
        .unwrap();
        (gate, settlement.receipt, settlement.receipt_id)
    }

    fn signed_command(
        gate: &X402Gate,
        receipt_id: &str,
        request_sha256: Option<String>,
        signer: &Keypair,
    ) -> (ReversalCommand, String) {
        let command = ReversalCommand {
            command_id: "cmd-1".into(),
            sponsor_ref: "sponsor-1".into(),
            agent_key_id: signer.key_id().to_string(),
            target: ReversalTarget {
                gate_id: gate.gate_id.clone(),
                receipt_id: receipt_id.to_string(),
                quote_id: None,
                request_sha256,
            },
            action: "reverse_release".into(),
            nonce: "nonce-1".into(),
            idempotency_key: "idem-1".into(),
            exp: EXP.into(),
        };
        let sig = signer.sign(&command.signed_bytes().unwrap());
        (command, sig)
    }

    fn trust_with(signer: &Keypair) -> TrustStore {
        let mut trust = TrustStore::new();
        trust
            .insert_pem(TrustRole::BuyerDecisionSigners, "buyer", signer.public_key_pem())
            .unwrap();
        trust
    }

    #[test]
    fn valid_reversal_flips_decision() {
        let (mut gate, receipt, receipt_id) = resolved_gate();
        let signer = Keypair::generate().unwrap();
        let (command, sig) =
            signed_command(&gate, &receipt_id, Some("a".repeat(64)), &signer);
        let decision = apply_reversal(
            &mut gate,
            &receipt,
            &receipt_id,
            &command,
            &sig,
            &trust_with(&signer),
            AT,
        )
        .unwrap();
        assert_eq!(gate.state, GateState::Reversed);
        assert_eq!(decision.released_amount_cents, 0);
        assert_eq!(decision.refunded_amount_cents, 500);
    }

    #[test]
    fn untrusted_signer_is_rejected() {
        let (mut gate, receipt, receipt_id) = resolved_gate();
        let signer = Keypair::generate().unwrap();
        let (command, sig) =
            signed_command(&gate, &receipt_id, Some("a".repeat(64)), &signer);
        let err = apply_reversal(
            &mut gate,
            &receipt,
            &receipt_id,
            &command,
            &sig,
            &TrustStore::new(),
            AT,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SignerNotTrusted);
        assert_eq!(gate.state, GateState::Resolved);
    }

    #[test]
    fn expired_command_is_rejected() {
        let (mut gate, receipt, receipt_id) = resolved_gate();
        let signer = Keypair::generate().unwrap();
        let (mut command, _) =
            signed_command(&gate, &receipt_id, Some("a".repeat(64)), &signer);
        command.exp = "2020-01-01T00:00:00.000Z".into();
        let sig = signer.sign(&command.signed_bytes().unwrap());
        let err = apply_reversal(
            &mut gate,
            &receipt,
            &receipt_id,
            &command,
            &sig,
            &trust_with(&signer),
            AT,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaInvalid);
    }

    #[test]
    fn missing_request_hash_is_required_error() {
        let (mut gate, receipt, receipt_id) = resolved_gate();
        let signer = Keypair::generate().unwrap();
        let (command, sig) = signed_command(&gate, &receipt_id, None, &signer);
        let err = apply_reversal(
            &mut gate,
            &receipt,
            &receipt_id,
            &command,
            &sig,
            &trust_with(&signer),
            AT,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::X402ReversalBindingEvidenceRequired);
    }

    #[test]
    fn mismatched_request_hash_is_binding_mismatch() {
        let (mut gate, receipt, receipt_id) = resolved_gate();
        let signer = Keypair::generate().unwrap();
        let (command, sig) =
            signed_command(&gate, &receipt_id, Some("f".repeat(64)), &signer);
        let err = apply_reversal(
            &mut gate,
            &receipt,
            &receipt_id,
            &command,
            &sig,
            &trust_with(&signer),
            AT,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::X402ReversalBindingEvidenceMismatch);
    }

    #[test]
    fn tampered_command_fails_signature() {
        let (mut gate, receipt, receipt_id) = resolved_gate();
        let signer = Keypair::generate().unwrap();
        let (mut command, sig) =
            signed_command(&gate, &receipt_id, Some("a".repeat(64)), &signer);
        command.sponsor_ref = "someone-else".into();
        let err = apply_reversal(
            &mut gate,
            &receipt,
            &receipt_id,
            &command,
            &sig,
            &trust_with(&signer),
            AT,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SignerNotTrusted);
    }
}
