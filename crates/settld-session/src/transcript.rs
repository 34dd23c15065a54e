// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session transcripts.
//!
//! A transcript is a readable projection of a session bound to the same
//! chain head as the replay pack: it carries the session hash, the head
//! chain hash, and the event count, and must agree with the pack on all
//! three.

use serde_json::{json, Value};
use settld_artifact::{seal, verify_seal, ArtifactSpec, Report};
use settld_canon::canonical_hash;
use settld_chain::ChainedEvent;
use settld_error::{ErrorCode, SettldError};

use crate::{Session, REPLAY_PACK};

/// `SessionTranscript.v1` wire shape.
pub const TRANSCRIPT: ArtifactSpec = ArtifactSpec {
    name: "SessionTranscript",
    version: 1,
    hash_field: "transcriptHash",
    core_field: "transcriptCore",
};

/// Build a sealed `SessionTranscript.v1` from a session and its events.
///
/// # Errors
///
/// Returns an internal error on canonicalization failure.
pub fn build_transcript(
    session: &Session,
    events: &[ChainedEvent],
    generated_at: &str,
) -> Result<Value, SettldError> {
    let session_hash = canonical_hash(session)
        .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;
    let entries: Vec<Value> = events
        .iter()
        .map(|e| {
            json!({
                "at": e.at,
                "actor": e.actor,
                "type": e.event_type,
                "eventId": e.id,
                "text": e.payload.get("text").and_then(Value::as_str),
            })
        })
        .collect();
    let core = json!({
        "sessionId": session.session_id,
        "tenantId": session.tenant_id,
        "sessionHash": session_hash,
        "headChainHash": events.last().map(|e| e.chain_hash.clone()),
        "eventCount": events.len() as u64,
        "entries": entries,
    });
    seal(&TRANSCRIPT, &core, generated_at)
        .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))
}

/// Verify a transcript against its replay pack.
///
/// The transcript must seal, and its `headChainHash` and `eventCount` must
/// equal the pack's.
#[must_use]
pub fn verify_transcript(transcript: &Value, replay_pack: &Value) -> Report {
    let mut report = Report::new();
    let Some(core) = verify_seal(&TRANSCRIPT, transcript, &mut report) else {
        return report;
    };
    let Some(pack_core) = replay_pack.get(REPLAY_PACK.core_field) else {
        report.error_code(
            ErrorCode::SchemaInvalid,
            REPLAY_PACK.core_field,
            "replay pack is missing its core",
        );
        return report;
    };

    for field in ["headChainHash", "eventCount"] {
        if core.get(field) != pack_core.get(field) {
            report.error_code(
                ErrorCode::CrossArtifactBindingMismatch,
                format!("transcriptCore.{field}"),
                format!("transcript and replay pack disagree on {field}"),
            );
        }
    }
    report
}
