// SPDX-License-Identifier: MIT OR Apache-2.0
//! The session substrate.
//!
//! Sessions hold participants and policy refs; session events are chained
//! exactly like stream events, scoped by session id. Two derived artifacts
//! bind a session to bytes: the replay pack (the full ordered chain plus a
//! verification block) and the transcript (a readable projection bound to
//! the same head hash). Provenance taint is recomputed from the chain on
//! every verification — recorded taint that disagrees fails closed.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Provenance taint computation.
pub mod provenance;
/// Replay pack build/verify.
pub mod replay;
/// Transcript build/verify.
pub mod transcript;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use settld_canon::ids::{is_valid_id, new_id, IdPrefix};
use settld_chain::{ChainedEvent, ChainedEventDraft, EventActor};
use settld_error::{ErrorCode, SettldError};
use settld_store::{Store, StoreError};

pub use provenance::{expected_provenance, Provenance};
pub use replay::{build_replay_pack, verify_replay_pack, REPLAY_PACK};
pub use transcript::{build_transcript, verify_transcript, TRANSCRIPT};

/// A participant in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Agent id (`agt_…`).
    pub agent_id: String,
    /// Role within the session (`"buyer"`, `"provider"`, `"observer"`).
    pub role: String,
}

/// A session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id (`sess_…`); doubles as the event stream id.
    pub session_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Participants.
    pub participants: Vec<Participant>,
    /// Governance policy references.
    pub policy_refs: Vec<String>,
    /// Creation timestamp.
    pub created_at: String,
}

impl Session {
    /// Create a session with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns `SCHEMA_INVALID` for malformed participant ids.
    pub fn new(
        tenant_id: &str,
        participants: Vec<Participant>,
        policy_refs: Vec<String>,
        created_at: &str,
    ) -> Result<Self, SettldError> {
        for p in &participants {
            if !is_valid_id(&p.agent_id) {
                return Err(SettldError::new(
                    ErrorCode::SchemaInvalid,
                    "invalid participant agent id",
                )
                .with_detail("agentId", p.agent_id.clone()));
            }
        }
        Ok(Self {
            session_id: new_id(IdPrefix::Session),
            tenant_id: tenant_id.to_string(),
            participants,
            policy_refs,
            created_at: created_at.to_string(),
        })
    }
}

/// Append a session event, stamping recomputed provenance into the payload.
///
/// The payload's `provenance.label` (if any) is read first; the substrate
/// then writes back the full `{label, isTainted, derivedFromEventId}` block
/// so the recorded taint always matches what a verifier will recompute.
///
/// # Errors
///
/// `SESSION_EVENT_CURSOR_CONFLICT` when concurrent appends race on the
/// cursor, plus the usual append failures.
pub fn append_session_event(
    store: &dyn Store,
    session: &Session,
    event_type: &str,
    actor: EventActor,
    mut payload: Value,
    expected_prev: Option<&str>,
) -> Result<ChainedEvent, SettldError> {
    let prior = store
        .list_events(&session.tenant_id, &session.session_id, None, None)
        .map_err(SettldError::from)?;

    let label = payload
        .get("provenance")
        .and_then(|p| p.get("label"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let provenance = provenance::stamp_for_next(&prior, label.as_deref());
    if let Some(provenance) = provenance {
        if !payload.is_object() {
            payload = serde_json::json!({});
        }
        payload["provenance"] = serde_json::to_value(&provenance)
            .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;
    }

    let head = prior.last().map(|e| e.chain_hash.clone());
    let event = ChainedEventDraft::new(
        session.session_id.clone(),
        event_type,
        actor,
        payload,
        None,
    )
    .map_err(|e| SettldError::new(ErrorCode::SchemaInvalid, e.to_string()))?
    .finalize(head, None)
    .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;

    let outcome = store
        .append_event(&session.tenant_id, &event, expected_prev, None)
        .map_err(|e| match e {
            StoreError::Conflict {
                actual_prev_chain_hash,
            } => SettldError::new(
                ErrorCode::SessionEventCursorConflict,
                "concurrent session appends raced on the event cursor",
            )
            .with_detail("expectedPrevChainHash", actual_prev_chain_hash),
            other => other.into(),
        })?;
    Ok(outcome.event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use settld_store::MemoryStore;

    fn session() -> Session {
        Session::new(
            "tenant-a",
            vec![Participant {
                agent_id: "agt_buyer".into(),
                role: "buyer".into(),
            }],
            vec!["policy-1".into()],
            "2026-02-02T00:00:00.000Z",
        )
        .unwrap()
    }

    #[test]
    fn appends_chain_within_session() {
        let store = MemoryStore::new();
        let sess = session();
        let e1 = append_session_event(
            &store,
            &sess,
            "MESSAGE",
            EventActor::new("agent", "agt_buyer"),
            json!({"text": "hello"}),
            None,
        )
        .unwrap();
        let e2 = append_session_event(
            &store,
            &sess,
            "TASK_REQUESTED",
            EventActor::new("agent", "agt_buyer"),
            json!({"task": "do it"}),
            None,
        )
        .unwrap();
        assert_eq!(e2.prev_chain_hash.as_deref(), Some(e1.chain_hash.as_str()));
    }

    #[test]
    fn taint_propagates_from_external_label() {
        let store = MemoryStore::new();
        let sess = session();
        let e1 = append_session_event(
            &store,
            &sess,
            "MESSAGE",
            EventActor::new("agent", "agt_buyer"),
            json!({"text": "hi", "provenance": {"label": "external"}}),
            None,
        )
        .unwrap();
        let e2 = append_session_event(
            &store,
            &sess,
            "TASK_REQUESTED",
            EventActor::new("agent", "agt_buyer"),
            json!({"task": "do it"}),
            None,
        )
        .unwrap();

        let p1: Provenance =
            serde_json::from_value(e1.payload["provenance"].clone()).unwrap();
        let p2: Provenance =
            serde_json::from_value(e2.payload["provenance"].clone()).unwrap();
        assert!(p1.is_tainted);
        assert_eq!(p1.derived_from_event_id, None);
        assert!(p2.is_tainted);
        assert_eq!(p2.derived_from_event_id.as_deref(), Some(e1.id.as_str()));
    }

    #[test]
    fn cursor_conflict_is_typed() {
        let store = MemoryStore::new();
        let sess = session();
        append_session_event(
            &store,
            &sess,
            "MESSAGE",
            EventActor::new("agent", "agt_buyer"),
            json!({}),
            None,
        )
        .unwrap();
        let err = append_session_event(
            &store,
            &sess,
            "MESSAGE",
            EventActor::new("agent", "agt_buyer"),
            json!({}),
            Some(&"0".repeat(64)),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionEventCursorConflict);
        assert!(err.details.contains_key("expectedPrevChainHash"));
    }
}
