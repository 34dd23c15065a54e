// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbox delivery: at-least-once, HMAC-signed, with retries and a DLQ.
//!
//! Artifact creation enqueues entries next to the domain write; a worker
//! leases due entries, POSTs the artifact to its destination with a stable
//! per-entry idempotency key, and resolves each attempt as delivered, retry
//! (exponential backoff with a bounded jitter band), or dead-lettered.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Backoff schedule with deterministic jitter.
pub mod backoff;
/// The delivery worker loop.
pub mod worker;

use serde::{Deserialize, Serialize};
use settld_canon::ids::{new_id, IdPrefix};
use settld_store::{OutboxEntry, OutboxState, Store, StoreError};

pub use backoff::RetryPolicy;
pub use worker::{DeliveryWorker, Destination, WorkerStats};

/// Enqueue one delivery per destination for a freshly persisted artifact.
///
/// The idempotency key is minted here, once, and never changes across
/// retries — receivers dedupe on it.
///
/// # Errors
///
/// Returns [`StoreError`] if the store rejects an entry.
pub fn enqueue_artifact(
    store: &dyn Store,
    tenant_id: &str,
    artifact_kind: &str,
    artifact_id: &str,
    destination_ids: &[String],
) -> Result<Vec<OutboxEntry>, StoreError> {
    let now = store.now_iso();
    let mut entries = Vec::with_capacity(destination_ids.len());
    for destination_id in destination_ids {
        let entry = OutboxEntry {
            id: new_id(IdPrefix::Outbox),
            tenant_id: tenant_id.to_string(),
            artifact_kind: artifact_kind.to_string(),
            artifact_id: artifact_id.to_string(),
            destination_id: destination_id.clone(),
            created_at: now.clone(),
            attempts: 0,
            next_attempt_at: now.clone(),
            state: OutboxState::Pending,
            // Minted once; receivers dedupe on it across every retry.
            idempotency_key: new_id(IdPrefix::Outbox),
            last_error: None,
            lease_deadline: None,
        };
        store.enqueue_outbox(tenant_id, &entry)?;
        entries.push(entry);
    }
    Ok(entries)
}

/// A dead-letter record surfaced to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqRecord {
    /// The parked entry.
    pub entry: OutboxEntry,
    /// The terminal error code (e.g. `DELIVERY_MAX_ATTEMPTS_EXCEEDED`).
    pub code: String,
}
