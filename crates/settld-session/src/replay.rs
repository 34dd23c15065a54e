// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session replay packs.
//!
//! A replay pack carries the full ordered event chain, its head hash, and a
//! verification block recorded at build time. Verification recomputes every
//! hash and the complete taint ordering from the embedded events — tampering
//! the chain bytes or the provenance fails closed with its own code. An
//! optional Ed25519 signature covers the canonical pack core; the same
//! signer key yields identical signature bytes.

use serde_json::{json, Value};
use settld_artifact::{seal, verify_seal, ArtifactSpec, Report};
use settld_canon::canonical_string;
use settld_chain::{verify_chain, ChainedEvent};
use settld_crypto::{Keypair, TrustStore};
use settld_error::{ErrorCode, SettldError};

use crate::provenance::{first_provenance_mismatch, recorded_tainted_count};
use crate::Session;

/// `SessionReplayPack.v1` wire shape.
pub const REPLAY_PACK: ArtifactSpec = ArtifactSpec {
    name: "SessionReplayPack",
    version: 1,
    hash_field: "packHash",
    core_field: "packCore",
};

/// Build a sealed (and optionally signed) `SessionReplayPack.v1`.
///
/// The chain and taint are verified during the build; a broken chain refuses
/// to build rather than producing a pack that cannot verify.
///
/// # Errors
///
/// `SESSION_REPLAY_CHAIN_INVALID` or `SESSION_REPLAY_PROVENANCE_INVALID`
/// when the source events do not verify.
pub fn build_replay_pack(
    session: &Session,
    events: &[ChainedEvent],
    generated_at: &str,
    signer: Option<&Keypair>,
) -> Result<Value, SettldError> {
    if let Err(broken) = verify_chain(events) {
        return Err(SettldError::new(
            ErrorCode::SessionReplayChainInvalid,
            broken.to_string(),
        )
        .with_detail("index", broken.index));
    }
    if let Some(index) = first_provenance_mismatch(events) {
        return Err(SettldError::new(
            ErrorCode::SessionReplayProvenanceInvalid,
            "recorded provenance disagrees with the chain",
        )
        .with_detail("index", index));
    }

    let tainted = recorded_tainted_count(events);
    let core = json!({
        "sessionId": session.session_id,
        "tenantId": session.tenant_id,
        "eventCount": events.len() as u64,
        "headChainHash": events.last().map(|e| e.chain_hash.clone()),
        "events": events,
        "verification": {
            "chainOk": true,
            "verifiedEventCount": events.len() as u64,
            "provenance": {
                "ok": true,
                "verifiedEventCount": events.len() as u64,
                "taintedEventCount": tainted,
            },
        },
    });

    let mut pack = seal(&REPLAY_PACK, &core, generated_at)
        .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;
    if let Some(keypair) = signer {
        let bytes = canonical_string(&core)
            .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;
        pack["signerKeyId"] = json!(keypair.key_id());
        pack["signature"] = json!(keypair.sign(bytes.as_bytes()));
    }
    Ok(pack)
}

/// Verify a `SessionReplayPack.v1` from its bytes alone.
///
/// Recomputes the seal, the full chain, the taint ordering, the recorded
/// verification block, and (when present) the signature against the trust
/// store.
#[must_use]
pub fn verify_replay_pack(pack: &Value, trust: Option<&TrustStore>) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&REPLAY_PACK, pack, &mut report) else {
        return report;
    };

    let events: Vec<ChainedEvent> = match core
        .get("events")
        .cloned()
        .map(serde_json::from_value)
    {
        Some(Ok(events)) => events,
        _ => {
            report.error_code(ErrorCode::SchemaInvalid, "packCore.events", "events not parseable");
            return report;
        }
    };

    if let Err(broken) = verify_chain(&events) {
        report.error(
            ErrorCode::SessionReplayChainInvalid.as_str(),
            format!("packCore.events[{}]", broken.index),
            broken.to_string(),
        );
    }

    let head = events.last().map(|e| e.chain_hash.as_str());
    if core.get("headChainHash").and_then(Value::as_str) != head {
        report.error_code(
            ErrorCode::SessionReplayChainInvalid,
            "packCore.headChainHash",
            "head hash does not match the last event",
        );
    }
    if core.get("eventCount").and_then(Value::as_u64) != Some(events.len() as u64) {
        report.error_code(
            ErrorCode::SchemaInvalid,
            "packCore.eventCount",
            "event count does not match the event list",
        );
    }

    if let Some(index) = first_provenance_mismatch(&events) {
        report.error(
            ErrorCode::SessionReplayProvenanceInvalid.as_str(),
            format!("packCore.events[{index}].payload.provenance"),
            "recorded provenance disagrees with recomputation",
        );
    }
    let recorded_block = core.get("verification").cloned().unwrap_or(Value::Null);
    let tainted = recorded_tainted_count(&events);
    if recorded_block
        .pointer("/provenance/taintedEventCount")
        .and_then(Value::as_u64)
        != Some(tainted)
    {
        report.error_code(
            ErrorCode::SessionReplayProvenanceInvalid,
            "packCore.verification.provenance.taintedEventCount",
            "recorded tainted count disagrees with recomputation",
        );
    }

    match (
        pack.get("signature").and_then(Value::as_str),
        pack.get("signerKeyId").and_then(Value::as_str),
    ) {
        (None, _) => {}
        (Some(_), None) => {
            report.error_code(
                ErrorCode::SchemaInvalid,
                "signerKeyId",
                "signature present without signerKeyId",
            );
        }
        (Some(signature), Some(key_id)) => match trust {
            None => report.error_code(
                ErrorCode::SignerNotTrusted,
                "signature",
                "signed pack but no trust file supplied",
            ),
            Some(trust) => {
                let bytes = canonical_string(core).unwrap_or_default();
                if let Err(e) = trust.verify(bytes.as_bytes(), signature, key_id) {
                    report.error_code(ErrorCode::SignerNotTrusted, "signature", e.to_string());
                }
            }
        },
    }

    report
}
