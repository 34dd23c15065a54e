// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed, per-stream hash-chained events.
//!
//! Every event binds to its predecessor through two digests:
//!
//! - `payloadHash = sha256(canonical({v,id,at,streamId,type,actor,payload}))`
//! - `chainHash   = sha256(canonical({v,prevChainHash,payloadHash}))`
//!
//! The first event of a stream carries `prevChainHash = null`. An optional
//! detached Ed25519 signature covers the canonical form of the event without
//! its `signature` member. No event is ever mutated or deleted.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use settld_canon::ids::{is_valid_id, new_id, IdPrefix};
use settld_canon::{canonical_hash, canonical_string, sha256_hex};
use settld_crypto::Keypair;

/// Wire version carried in `v` by every event.
pub const EVENT_VERSION: u64 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from event construction and integrity checks.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// An identifier failed the `^[A-Za-z0-9_-]{1,128}$` constraint.
    #[error("SCHEMA_INVALID: invalid identifier {field}={value:?}")]
    InvalidId {
        /// Which field was invalid.
        field: &'static str,
        /// The offending value.
        value: String,
    },

    /// Recomputed hashes or the signature do not match the event.
    #[error("EVENT_INTEGRITY_INVALID: {reason}")]
    IntegrityInvalid {
        /// What failed to match.
        reason: String,
    },

    /// Canonicalization failed.
    #[error(transparent)]
    Canon(#[from] settld_canon::CanonError),
}

/// A broken link found by [`verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("CHAIN_BROKEN_AT_INDEX_{index}: {reason}")]
pub struct ChainBroken {
    /// Index of the first event that failed to verify.
    pub index: usize,
    /// What failed at that index.
    pub reason: String,
}

impl ChainBroken {
    /// The stable error-code string, `CHAIN_BROKEN_AT_INDEX_<i>`.
    #[must_use]
    pub fn code(&self) -> String {
        format!("CHAIN_BROKEN_AT_INDEX_{}", self.index)
    }
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// The actor that caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventActor {
    /// Actor category (e.g. `"agent"`, `"operator"`, `"system"`).
    #[serde(rename = "type")]
    pub actor_type: String,
    /// Actor identifier.
    pub id: String,
}

impl EventActor {
    /// Convenience constructor.
    pub fn new(actor_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            actor_type: actor_type.into(),
            id: id.into(),
        }
    }
}

/// A finalized, hash-chained event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainedEvent {
    /// Wire version (always [`EVENT_VERSION`]).
    pub v: u64,
    /// Event id (`evt_…`).
    pub id: String,
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Domain event type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// RFC-3339 UTC timestamp.
    pub at: String,
    /// Actor that caused the event.
    pub actor: EventActor,
    /// Opaque payload; the substrate hashes it but never interprets it.
    pub payload: Value,
    /// Chain hash of the predecessor; `null` for the genesis event.
    pub prev_chain_hash: Option<String>,
    /// Digest over the event's identifying members and payload.
    pub payload_hash: String,
    /// Digest linking this event to its predecessor.
    pub chain_hash: String,
    /// Signer key id, when signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_key_id: Option<String>,
    /// Detached base64 signature, when signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Rolling head of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapshot {
    /// Stream identifier.
    pub stream_id: String,
    /// Chain hash of the most recent event, if any.
    pub last_chain_hash: Option<String>,
    /// Id of the most recent event, if any.
    pub last_event_id: Option<String>,
    /// Number of events appended so far.
    pub event_count: u64,
}

impl StreamSnapshot {
    /// Snapshot of an empty stream.
    #[must_use]
    pub fn empty(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            last_chain_hash: None,
            last_event_id: None,
            event_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Hash inputs
// ---------------------------------------------------------------------------

fn payload_hash_input(
    id: &str,
    at: &str,
    stream_id: &str,
    event_type: &str,
    actor: &EventActor,
    payload: &Value,
) -> Value {
    json!({
        "v": EVENT_VERSION,
        "id": id,
        "at": at,
        "streamId": stream_id,
        "type": event_type,
        "actor": actor,
        "payload": payload,
    })
}

fn chain_hash_input(prev_chain_hash: &Option<String>, payload_hash: &str) -> Value {
    json!({
        "v": EVENT_VERSION,
        "prevChainHash": prev_chain_hash,
        "payloadHash": payload_hash,
    })
}

/// Canonical bytes of an event with its `signature` member removed.
///
/// This is the exact byte string a detached event signature covers.
///
/// # Errors
///
/// Returns [`ChainError::Canon`] if the event cannot be canonicalized.
pub fn signing_bytes(event: &ChainedEvent) -> Result<Vec<u8>, ChainError> {
    let mut v = serde_json::to_value(event).map_err(settld_canon::CanonError::from)?;
    if let Value::Object(map) = &mut v {
        map.remove("signature");
    }
    Ok(canonical_string(&v)?.into_bytes())
}

// ---------------------------------------------------------------------------
// Draft / finalize
// ---------------------------------------------------------------------------

/// An event that has an identity and a payload hash but is not yet linked
/// into a stream.
#[derive(Debug, Clone)]
pub struct ChainedEventDraft {
    /// Event id (`evt_…`).
    pub id: String,
    /// Stream this event will be appended to.
    pub stream_id: String,
    /// Domain event type tag.
    pub event_type: String,
    /// RFC-3339 UTC timestamp.
    pub at: String,
    /// Actor that caused the event.
    pub actor: EventActor,
    /// Opaque payload.
    pub payload: Value,
    /// Digest over the event's identifying members and payload.
    pub payload_hash: String,
}

impl ChainedEventDraft {
    /// Create a draft: mints the id, stamps `at` (unless supplied), and
    /// computes the payload hash.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::InvalidId`] for malformed identifiers, or
    /// [`ChainError::Canon`] if the payload cannot be canonicalized.
    pub fn new(
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        actor: EventActor,
        payload: Value,
        at: Option<String>,
    ) -> Result<Self, ChainError> {
        let stream_id = stream_id.into();
        if !is_valid_id(&stream_id) {
            return Err(ChainError::InvalidId {
                field: "streamId",
                value: stream_id,
            });
        }
        if !is_valid_id(&actor.id) {
            return Err(ChainError::InvalidId {
                field: "actor.id",
                value: actor.id.clone(),
            });
        }
        let event_type = event_type.into();
        let id = new_id(IdPrefix::Event);
        let at = at.unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let payload_hash = canonical_hash(&payload_hash_input(
            &id,
            &at,
            &stream_id,
            &event_type,
            &actor,
            &payload,
        ))?;
        Ok(Self {
            id,
            stream_id,
            event_type,
            at,
            actor,
            payload,
            payload_hash,
        })
    }

    /// Link the draft to a predecessor and optionally sign it.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Canon`] if hashing or signing input assembly
    /// fails.
    pub fn finalize(
        self,
        prev_chain_hash: Option<String>,
        signer: Option<&Keypair>,
    ) -> Result<ChainedEvent, ChainError> {
        let chain_hash = canonical_hash(&chain_hash_input(&prev_chain_hash, &self.payload_hash))?;
        let mut event = ChainedEvent {
            v: EVENT_VERSION,
            id: self.id,
            stream_id: self.stream_id,
            event_type: self.event_type,
            at: self.at,
            actor: self.actor,
            payload: self.payload,
            prev_chain_hash,
            payload_hash: self.payload_hash,
            chain_hash,
            signer_key_id: None,
            signature: None,
        };
        if let Some(keypair) = signer {
            event.signer_key_id = Some(keypair.key_id().to_string());
            let bytes = signing_bytes(&event)?;
            event.signature = Some(keypair.sign(&bytes));
        }
        Ok(event)
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Recompute both event hashes and compare to the stored values.
///
/// # Errors
///
/// Returns [`ChainError::IntegrityInvalid`] naming the first mismatching
/// digest.
pub fn verify_event_hashes(event: &ChainedEvent) -> Result<(), ChainError> {
    if event.v != EVENT_VERSION {
        return Err(ChainError::IntegrityInvalid {
            reason: format!("unsupported event version {}", event.v),
        });
    }
    let payload_hash = canonical_hash(&payload_hash_input(
        &event.id,
        &event.at,
        &event.stream_id,
        &event.event_type,
        &event.actor,
        &event.payload,
    ))?;
    if payload_hash != event.payload_hash {
        return Err(ChainError::IntegrityInvalid {
            reason: "payloadHash mismatch".into(),
        });
    }
    let chain_hash = canonical_hash(&chain_hash_input(&event.prev_chain_hash, &event.payload_hash))?;
    if chain_hash != event.chain_hash {
        return Err(ChainError::IntegrityInvalid {
            reason: "chainHash mismatch".into(),
        });
    }
    Ok(())
}

/// Verify an event's detached signature against a public key PEM.
///
/// # Errors
///
/// Returns [`ChainError::IntegrityInvalid`] if the event claims a signature
/// that does not verify, or claims a signer without a signature.
pub fn verify_event_signature(
    event: &ChainedEvent,
    public_key_pem: &str,
) -> Result<(), ChainError> {
    let Some(signature) = event.signature.as_deref() else {
        return Err(ChainError::IntegrityInvalid {
            reason: "event has no signature".into(),
        });
    };
    let bytes = signing_bytes(event)?;
    if !settld_crypto::verify_detached_pem(&bytes, signature, public_key_pem) {
        return Err(ChainError::IntegrityInvalid {
            reason: "signature verification failed".into(),
        });
    }
    Ok(())
}

/// Linearly verify a whole stream: hashes, linkage, and monotone ordering.
///
/// # Errors
///
/// Returns [`ChainBroken`] for the first index whose hashes do not recompute
/// or whose `prevChainHash` does not equal the previous event's `chainHash`.
pub fn verify_chain(events: &[ChainedEvent]) -> Result<(), ChainBroken> {
    let mut prev_hash: Option<&str> = None;
    for (i, event) in events.iter().enumerate() {
        if let Err(e) = verify_event_hashes(event) {
            return Err(ChainBroken {
                index: i,
                reason: e.to_string(),
            });
        }
        if event.prev_chain_hash.as_deref() != prev_hash {
            return Err(ChainBroken {
                index: i,
                reason: format!(
                    "prevChainHash {:?} does not match predecessor head {:?}",
                    event.prev_chain_hash, prev_hash
                ),
            });
        }
        prev_hash = Some(event.chain_hash.as_str());
    }
    Ok(())
}

/// Digest of a whole event list (used when artifacts bind a stream segment).
///
/// # Errors
///
/// Returns [`ChainError::Canon`] on canonicalization failure.
pub fn events_digest(events: &[ChainedEvent]) -> Result<String, ChainError> {
    let hashes: Vec<&str> = events.iter().map(|e| e.chain_hash.as_str()).collect();
    let s = canonical_string(&hashes)?;
    Ok(sha256_hex(s.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn actor() -> EventActor {
        EventActor::new("agent", "agt_tester")
    }

    fn append(stream: &str, prev: Option<String>, payload: Value) -> ChainedEvent {
        ChainedEventDraft::new(stream, "MESSAGE", actor(), payload, None)
            .unwrap()
            .finalize(prev, None)
            .unwrap()
    }

    #[test]
    fn genesis_event_has_null_prev() {
        let e = append("stream-1", None, json!({"n": 1}));
        assert_eq!(e.prev_chain_hash, None);
        assert!(verify_event_hashes(&e).is_ok());
    }

    #[test]
    fn chain_links_and_verifies() {
        let e1 = append("stream-1", None, json!({"n": 1}));
        let e2 = append("stream-1", Some(e1.chain_hash.clone()), json!({"n": 2}));
        let e3 = append("stream-1", Some(e2.chain_hash.clone()), json!(null));
        assert!(verify_chain(&[e1, e2, e3]).is_ok());
    }

    #[test]
    fn tampered_payload_breaks_at_index() {
        let e1 = append("stream-1", None, json!({"n": 1}));
        let mut e2 = append("stream-1", Some(e1.chain_hash.clone()), json!({"n": 2}));
        e2.payload = json!({"n": 999});
        let err = verify_chain(&[e1, e2]).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.code(), "CHAIN_BROKEN_AT_INDEX_1");
    }

    #[test]
    fn broken_linkage_reports_first_bad_index() {
        let e1 = append("stream-1", None, json!(1));
        let stranger = append("stream-1", None, json!(2));
        let err = verify_chain(&[e1, stranger]).unwrap_err();
        assert_eq!(err.index, 1);
    }

    #[test]
    fn payload_hash_matches_spec_shape() {
        // The hash input is the canonical form of the seven identifying
        // members, keys sorted byte-wise.
        let e = append("stream-1", None, json!({"k": "v"}));
        let input = json!({
            "actor": {"id": "agt_tester", "type": "agent"},
            "at": e.at,
            "id": e.id,
            "payload": {"k": "v"},
            "streamId": "stream-1",
            "type": "MESSAGE",
            "v": 1,
        });
        assert_eq!(e.payload_hash, canonical_hash(&input).unwrap());
    }

    #[test]
    fn null_payload_is_hashed_not_dropped() {
        let a = append("stream-1", None, json!(null));
        let b = append("stream-1", None, json!({}));
        assert_ne!(
            a.payload_hash, b.payload_hash,
            "null and empty-object payloads must hash differently"
        );
    }

    #[test]
    fn signature_covers_event_without_signature_member() {
        let kp = settld_crypto::Keypair::generate().unwrap();
        let e = ChainedEventDraft::new("stream-1", "MESSAGE", actor(), json!({"m": "hi"}), None)
            .unwrap()
            .finalize(None, Some(&kp))
            .unwrap();
        assert_eq!(e.signer_key_id.as_deref(), Some(kp.key_id()));
        assert!(verify_event_signature(&e, kp.public_key_pem()).is_ok());

        // Flipping payload bytes after signing must fail verification.
        let mut tampered = e.clone();
        tampered.payload = json!({"m": "bye"});
        assert!(verify_event_signature(&tampered, kp.public_key_pem()).is_err());
    }

    #[test]
    fn invalid_stream_id_rejected() {
        let err = ChainedEventDraft::new("bad stream", "MESSAGE", actor(), json!(null), None)
            .unwrap_err();
        assert!(matches!(err, ChainError::InvalidId { field: "streamId", .. }));
    }

    #[test]
    fn events_digest_is_order_sensitive() {
        let e1 = append("s", None, json!(1));
        let e2 = append("s", Some(e1.chain_hash.clone()), json!(2));
        let d1 = events_digest(&[e1.clone(), e2.clone()]).unwrap();
        let d2 = events_digest(&[e2, e1]).unwrap();
        assert_ne!(d1, d2);
    }

    #[test]
    fn fixed_at_makes_draft_hash_reproducible() {
        let at = Some("2026-02-02T00:00:00.000Z".to_string());
        let d1 =
            ChainedEventDraft::new("s", "MESSAGE", actor(), json!({"x": 1}), at.clone()).unwrap();
        let d2 = ChainedEventDraft::new("s", "MESSAGE", actor(), json!({"x": 1}), at).unwrap();
        // Ids differ (freshly minted) so payload hashes differ, but both
        // recompute under verification.
        let e1 = d1.finalize(None, None).unwrap();
        let e2 = d2.finalize(None, None).unwrap();
        assert!(verify_event_hashes(&e1).is_ok());
        assert!(verify_event_hashes(&e2).is_ok());
        assert_ne!(e1.id, e2.id);
    }
}
