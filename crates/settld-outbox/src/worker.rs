// SPDX-License-Identifier: MIT OR Apache-2.0
//! The delivery worker.
//!
//! Leases due outbox entries, POSTs each artifact to its destination with the
//! canonical body and an HMAC signature header, and resolves the attempt.
//! Multiple workers may run concurrently: leases prevent double-delivery and
//! the attempts counter bounds fan-out.

use chrono::Duration;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use settld_canon::canonical_string;
use settld_crypto::webhook_signature;
use settld_error::ErrorCode;
use settld_store::{OutboxAck, OutboxEntry, Store};

use crate::backoff::RetryPolicy;

/// A delivery destination: URL plus shared HMAC secret.
#[derive(Debug, Clone)]
pub struct Destination {
    /// Webhook URL.
    pub url: String,
    /// Shared secret for the `x-signature` header.
    pub secret: String,
}

/// Counters from one worker pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Entries leased this pass.
    pub leased: usize,
    /// Entries delivered.
    pub delivered: usize,
    /// Entries scheduled for retry.
    pub retried: usize,
    /// Entries dead-lettered.
    pub dead_lettered: usize,
}

/// At-least-once delivery worker over one store.
pub struct DeliveryWorker {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    destinations: BTreeMap<String, Destination>,
    policy: RetryPolicy,
}

impl DeliveryWorker {
    /// Create a worker.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        destinations: BTreeMap<String, Destination>,
        policy: RetryPolicy,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(policy.delivery_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            store,
            client,
            destinations,
            policy,
        }
    }

    /// Lease and deliver up to `batch` due entries for one tenant.
    ///
    /// # Errors
    ///
    /// Returns a [`settld_store::StoreError`] only for store faults; delivery
    /// failures are resolved into retries or DLQ entries, never bubbled.
    pub async fn run_once(
        &self,
        tenant_id: &str,
        batch: usize,
    ) -> Result<WorkerStats, settld_store::StoreError> {
        let now = self.store.now_iso();
        let lease_deadline = lease_deadline(&now, self.policy.lease_secs);
        let leased = self
            .store
            .lease_outbox(tenant_id, batch, &now, &lease_deadline)?;

        let mut stats = WorkerStats {
            leased: leased.len(),
            ..WorkerStats::default()
        };

        for entry in leased {
            let ack = self.deliver(tenant_id, &entry).await;
            match &ack {
                OutboxAck::Delivered => stats.delivered += 1,
                OutboxAck::Retry { .. } => stats.retried += 1,
                OutboxAck::Dlq { .. } => stats.dead_lettered += 1,
            }
            self.store.ack_outbox(tenant_id, &entry.id, &ack)?;
        }
        Ok(stats)
    }

    /// Attempt one delivery and decide its resolution.
    async fn deliver(&self, tenant_id: &str, entry: &OutboxEntry) -> OutboxAck {
        let Some(destination) = self.destinations.get(&entry.destination_id) else {
            // No configured destination is a logical error, not a transient
            // one: straight to the DLQ.
            return OutboxAck::Dlq {
                error: format!("unknown destination {}", entry.destination_id),
            };
        };

        let artifact = match self
            .store
            .get_artifact(tenant_id, &entry.artifact_kind, &entry.artifact_id)
        {
            Ok(Some(record)) => record.body,
            Ok(None) => {
                return OutboxAck::Dlq {
                    error: format!(
                        "artifact {}/{} not found",
                        entry.artifact_kind, entry.artifact_id
                    ),
                }
            }
            Err(e) => return self.resolve_failure(entry, ErrorCode::DeliveryHttpError, &e.to_string()),
        };

        let body = match canonical_string(&artifact) {
            Ok(body) => body,
            Err(e) => {
                return OutboxAck::Dlq {
                    error: format!("artifact not canonicalizable: {e}"),
                }
            }
        };
        let signature = webhook_signature(destination.secret.as_bytes(), body.as_bytes());

        let response = self
            .client
            .post(&destination.url)
            .header("content-type", "application/json")
            .header("x-tenant-id", tenant_id)
            .header("x-artifact-type", &entry.artifact_kind)
            .header("x-artifact-id", &entry.artifact_id)
            .header("x-idempotency-key", &entry.idempotency_key)
            .header("x-signature", &signature)
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                info!(
                    entry = %entry.id,
                    destination = %entry.destination_id,
                    attempts = entry.attempts,
                    "delivered"
                );
                OutboxAck::Delivered
            }
            Ok(resp) => self.resolve_failure(
                entry,
                ErrorCode::DeliveryHttpError,
                &format!("status {}", resp.status().as_u16()),
            ),
            Err(e) if e.is_timeout() => {
                self.resolve_failure(entry, ErrorCode::DeliveryTimeout, "deadline exceeded")
            }
            Err(e) => self.resolve_failure(entry, ErrorCode::DeliveryHttpError, &e.to_string()),
        }
    }

    fn resolve_failure(&self, entry: &OutboxEntry, code: ErrorCode, detail: &str) -> OutboxAck {
        let error = format!("{}: {detail}", code.as_str());
        if self.policy.exhausted(entry.attempts) {
            warn!(entry = %entry.id, attempts = entry.attempts, %error, "dead-lettered");
            return OutboxAck::Dlq {
                error: format!("{}: {error}", ErrorCode::DeliveryMaxAttemptsExceeded.as_str()),
            };
        }
        let now = chrono::Utc::now();
        warn!(entry = %entry.id, attempts = entry.attempts, %error, "retry scheduled");
        OutboxAck::Retry {
            error,
            next_attempt_at: self.policy.next_attempt_at(now, entry.attempts, &entry.id),
        }
    }
}

fn lease_deadline(now_iso: &str, lease_secs: u64) -> String {
    chrono::DateTime::parse_from_rfc3339(now_iso)
        .map(|t| {
            (t.with_timezone(&chrono::Utc) + Duration::seconds(lease_secs as i64))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        })
        .unwrap_or_else(|_| now_iso.to_string())
}
