// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared append validation used by every driver.
//!
//! Drivers acquire their lock or transaction first, read the stream head,
//! then run these checks before persisting. Keeping the logic here means the
//! memory and SQLite drivers cannot drift.

use settld_chain::{verify_event_hashes, verify_event_signature, ChainedEvent, StreamSnapshot};

use crate::{AuthKeyRecord, KeyStatus, StoreError};

/// Validate an event against the current stream head.
///
/// Order matters and mirrors the append algorithm:
/// 1. the caller's `expected_prev` guard (conflict carries the server head),
/// 2. the event's own `prevChainHash` linkage,
/// 3. hash recomputation,
/// 4. signature + signer key status when the event is signed.
///
/// # Errors
///
/// [`StoreError::Conflict`], [`StoreError::IntegrityInvalid`], or
/// [`StoreError::SignerKeyNotActive`].
pub fn validate_append(
    event: &ChainedEvent,
    head: &StreamSnapshot,
    expected_prev: Option<&str>,
    auth_key: Option<&AuthKeyRecord>,
) -> Result<(), StoreError> {
    if let Some(expected) = expected_prev
        && Some(expected) != head.last_chain_hash.as_deref()
    {
        return Err(StoreError::Conflict {
            actual_prev_chain_hash: head.last_chain_hash.clone(),
        });
    }

    if event.prev_chain_hash.as_deref() != head.last_chain_hash.as_deref() {
        return Err(StoreError::IntegrityInvalid {
            reason: format!(
                "event prevChainHash {:?} does not match stream head {:?}",
                event.prev_chain_hash, head.last_chain_hash
            ),
        });
    }

    verify_event_hashes(event).map_err(|e| StoreError::IntegrityInvalid {
        reason: e.to_string(),
    })?;

    if let Some(key_id) = event.signer_key_id.as_deref() {
        let Some(key) = auth_key else {
            return Err(StoreError::IntegrityInvalid {
                reason: format!("unknown signer key {key_id}"),
            });
        };
        if key.status != KeyStatus::Active {
            return Err(StoreError::SignerKeyNotActive {
                key_id: key_id.to_string(),
            });
        }
        verify_event_signature(event, &key.public_key_pem).map_err(|e| {
            StoreError::IntegrityInvalid {
                reason: e.to_string(),
            }
        })?;
    } else if event.signature.is_some() {
        return Err(StoreError::IntegrityInvalid {
            reason: "signature present without signerKeyId".into(),
        });
    }

    Ok(())
}

/// Advance a snapshot after a validated append.
pub(crate) fn advance_snapshot(head: &StreamSnapshot, event: &ChainedEvent) -> StreamSnapshot {
    StreamSnapshot {
        stream_id: head.stream_id.clone(),
        last_chain_hash: Some(event.chain_hash.clone()),
        last_event_id: Some(event.id.clone()),
        event_count: head.event_count + 1,
    }
}
