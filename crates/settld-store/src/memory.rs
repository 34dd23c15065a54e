// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory store driver.
//!
//! Process-wide maps guarded by a single mutex. The mutex doubles as the
//! per-stream append lock: appends, idempotent replays, and outbox leases are
//! serialized, so the read-check-write sequences in this file are atomic.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use settld_chain::{ChainedEvent, StreamSnapshot};

use crate::checks::{advance_snapshot, validate_append};
use crate::{
    AppendOutcome, ArtifactFilter, ArtifactRecord, AuthKeyRecord, Clock, IdempotencyRecord,
    OpsAuditRecord, OutboxAck, OutboxEntry, OutboxState, Store, StoreError, SystemClock,
};

type TenantKey = (String, String);
type TupleKey = (String, String, String);

#[derive(Default)]
struct Inner {
    // (tenant, stream) -> ordered events
    events: BTreeMap<TenantKey, Vec<ChainedEvent>>,
    // (tenant, stream) -> head snapshot
    snapshots: BTreeMap<TenantKey, StreamSnapshot>,
    // (tenant, kind, id) -> artifact
    artifacts: BTreeMap<TupleKey, ArtifactRecord>,
    // (tenant, key_id) -> auth key
    auth_keys: BTreeMap<TenantKey, AuthKeyRecord>,
    // (tenant, key) -> idempotency record
    idempotency: BTreeMap<TenantKey, IdempotencyRecord>,
    // (tenant, entry id) -> outbox entry
    outbox: BTreeMap<TenantKey, OutboxEntry>,
    // tenant -> audit records
    ops_audit: BTreeMap<String, Vec<OpsAuditRecord>>,
}

/// Mutex-guarded in-memory driver.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with an injected clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panic mid-write; propagating the panic is
        // the only sound option for an integrity-bearing store.
        self.inner.lock().expect("memory store mutex poisoned")
    }
}

impl Store for MemoryStore {
    fn now_iso(&self) -> String {
        self.clock.now_iso()
    }

    fn append_event(
        &self,
        tenant_id: &str,
        event: &ChainedEvent,
        expected_prev: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.lock();
        let stream_key = (tenant_id.to_string(), event.stream_id.clone());

        // Idempotent replay: same key on the same stream returns the prior
        // event unchanged, producing no new state.
        if let Some(key) = idempotency_key {
            let idem_key = (tenant_id.to_string(), append_idem_key(&event.stream_id, key));
            if let Some(record) = inner.idempotency.get(&idem_key) {
                let prior_id = record.outcome.as_str().unwrap_or_default().to_string();
                let prior = inner
                    .events
                    .get(&stream_key)
                    .and_then(|evs| evs.iter().find(|e| e.id == prior_id))
                    .cloned();
                if let Some(prior) = prior {
                    let snapshot = inner
                        .snapshots
                        .get(&stream_key)
                        .cloned()
                        .unwrap_or_else(|| StreamSnapshot::empty(&event.stream_id));
                    return Ok(AppendOutcome {
                        event: prior,
                        stream_snapshot: snapshot,
                        deduped: true,
                    });
                }
            }
        }

        let head = inner
            .snapshots
            .get(&stream_key)
            .cloned()
            .unwrap_or_else(|| StreamSnapshot::empty(&event.stream_id));

        let auth_key = event.signer_key_id.as_deref().and_then(|key_id| {
            inner
                .auth_keys
                .get(&(tenant_id.to_string(), key_id.to_string()))
                .cloned()
        });
        validate_append(event, &head, expected_prev, auth_key.as_ref())?;

        let snapshot = advance_snapshot(&head, event);
        inner
            .events
            .entry(stream_key.clone())
            .or_default()
            .push(event.clone());
        inner.snapshots.insert(stream_key, snapshot.clone());

        if let Some(key) = idempotency_key {
            let now = self.clock.now();
            let record = IdempotencyRecord {
                key: key.to_string(),
                outcome: Value::String(event.id.clone()),
                stored_at: self.clock.now_iso(),
                expires_at: iso(now + Duration::hours(24)),
            };
            inner.idempotency.insert(
                (tenant_id.to_string(), append_idem_key(&event.stream_id, key)),
                record,
            );
        }

        Ok(AppendOutcome {
            event: event.clone(),
            stream_snapshot: snapshot,
            deduped: false,
        })
    }

    fn list_events(
        &self,
        tenant_id: &str,
        stream_id: &str,
        since_event_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<ChainedEvent>, StoreError> {
        let inner = self.lock();
        let Some(events) = inner
            .events
            .get(&(tenant_id.to_string(), stream_id.to_string()))
        else {
            return Ok(vec![]);
        };
        let start = match since_event_id {
            Some(id) => match events.iter().position(|e| e.id == id) {
                Some(pos) => pos + 1,
                None => return Ok(vec![]),
            },
            None => 0,
        };
        let mut out: Vec<ChainedEvent> = events[start..].to_vec();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn get_stream_snapshot(
        &self,
        tenant_id: &str,
        stream_id: &str,
    ) -> Result<Option<StreamSnapshot>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .snapshots
            .get(&(tenant_id.to_string(), stream_id.to_string()))
            .cloned())
    }

    fn put_artifact(&self, tenant_id: &str, record: &ArtifactRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (
            tenant_id.to_string(),
            record.kind.clone(),
            record.id.clone(),
        );
        if inner.artifacts.contains_key(&key) {
            return Err(StoreError::Duplicate {
                what: "artifact",
                id: record.id.clone(),
            });
        }
        inner.artifacts.insert(key, record.clone());
        Ok(())
    }

    fn get_artifact(
        &self,
        tenant_id: &str,
        kind: &str,
        id: &str,
    ) -> Result<Option<ArtifactRecord>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .artifacts
            .get(&(tenant_id.to_string(), kind.to_string(), id.to_string()))
            .cloned())
    }

    fn list_artifacts(
        &self,
        tenant_id: &str,
        filter: &ArtifactFilter,
    ) -> Result<Vec<ArtifactRecord>, StoreError> {
        let inner = self.lock();
        let mut out: Vec<ArtifactRecord> = inner
            .artifacts
            .iter()
            .filter(|((t, kind, _), record)| {
                t == tenant_id
                    && filter.kind.as_deref().is_none_or(|k| k == kind)
                    && filter
                        .since
                        .as_deref()
                        .is_none_or(|s| record.created_at.as_str() >= s)
            })
            .map(|(_, record)| record.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn put_auth_key(&self, tenant_id: &str, record: &AuthKeyRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .auth_keys
            .insert((tenant_id.to_string(), record.key_id.clone()), record.clone());
        Ok(())
    }

    fn lookup_auth_key(
        &self,
        tenant_id: &str,
        key_id: &str,
    ) -> Result<Option<AuthKeyRecord>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .auth_keys
            .get(&(tenant_id.to_string(), key_id.to_string()))
            .cloned())
    }

    fn put_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
        outcome: &Value,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = self.clock.now();
        let record = IdempotencyRecord {
            key: key.to_string(),
            outcome: outcome.clone(),
            stored_at: iso(now),
            expires_at: iso(now + Duration::seconds(ttl_secs as i64)),
        };
        inner
            .idempotency
            .insert((tenant_id.to_string(), key.to_string()), record);
        Ok(())
    }

    fn get_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let inner = self.lock();
        let Some(record) = inner
            .idempotency
            .get(&(tenant_id.to_string(), key.to_string()))
        else {
            return Ok(None);
        };
        if record.expires_at <= self.clock.now_iso() {
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }

    fn enqueue_outbox(&self, tenant_id: &str, entry: &OutboxEntry) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (tenant_id.to_string(), entry.id.clone());
        if inner.outbox.contains_key(&key) {
            return Err(StoreError::Duplicate {
                what: "outbox entry",
                id: entry.id.clone(),
            });
        }
        inner.outbox.insert(key, entry.clone());
        Ok(())
    }

    fn lease_outbox(
        &self,
        tenant_id: &str,
        n: usize,
        now: &str,
        lease_deadline: &str,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut inner = self.lock();
        let mut leased = Vec::new();
        for ((t, _), entry) in inner.outbox.iter_mut() {
            if leased.len() >= n || t != tenant_id {
                continue;
            }
            let due = match entry.state {
                OutboxState::Pending => entry.next_attempt_at.as_str() <= now,
                // An expired lease is re-leasable.
                OutboxState::Leased => {
                    entry.lease_deadline.as_deref().is_some_and(|d| d <= now)
                }
                _ => false,
            };
            if due {
                entry.state = OutboxState::Leased;
                entry.lease_deadline = Some(lease_deadline.to_string());
                entry.attempts += 1;
                leased.push(entry.clone());
            }
        }
        Ok(leased)
    }

    fn ack_outbox(
        &self,
        tenant_id: &str,
        entry_id: &str,
        ack: &OutboxAck,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner
            .outbox
            .get_mut(&(tenant_id.to_string(), entry_id.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                what: "outbox entry",
                id: entry_id.to_string(),
            })?;
        entry.lease_deadline = None;
        match ack {
            OutboxAck::Delivered => {
                entry.state = OutboxState::Delivered;
                entry.last_error = None;
            }
            OutboxAck::Retry {
                error,
                next_attempt_at,
            } => {
                entry.state = OutboxState::Pending;
                entry.last_error = Some(error.clone());
                entry.next_attempt_at = next_attempt_at.clone();
            }
            OutboxAck::Dlq { error } => {
                entry.state = OutboxState::Dlq;
                entry.last_error = Some(error.clone());
            }
        }
        Ok(())
    }

    fn get_outbox(
        &self,
        tenant_id: &str,
        entry_id: &str,
    ) -> Result<Option<OutboxEntry>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .outbox
            .get(&(tenant_id.to_string(), entry_id.to_string()))
            .cloned())
    }

    fn put_ops_audit(&self, tenant_id: &str, record: &OpsAuditRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .ops_audit
            .entry(tenant_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn list_ops_audit(&self, tenant_id: &str) -> Result<Vec<OpsAuditRecord>, StoreError> {
        let inner = self.lock();
        Ok(inner.ops_audit.get(tenant_id).cloned().unwrap_or_default())
    }
}

/// Namespaced idempotency key for event appends.
fn append_idem_key(stream_id: &str, key: &str) -> String {
    format!("append:{stream_id}:{key}")
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
