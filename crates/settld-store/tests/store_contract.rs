// SPDX-License-Identifier: MIT OR Apache-2.0
//! Contract tests that run identically over both store drivers.

use serde_json::json;
use settld_chain::{ChainedEvent, ChainedEventDraft, EventActor};
use settld_store::{
    ArtifactFilter, ArtifactRecord, AuthKeyRecord, KeyStatus, MemoryStore, OutboxAck, OutboxEntry,
    OutboxState, SqliteStore, Store, StoreError,
};

const TENANT: &str = "tenant-a";

fn drivers() -> Vec<(&'static str, Box<dyn Store>)> {
    vec![
        ("memory", Box::new(MemoryStore::new())),
        ("sqlite", Box::new(SqliteStore::open_in_memory().unwrap())),
    ]
}

fn event(stream: &str, prev: Option<String>, n: i64) -> ChainedEvent {
    ChainedEventDraft::new(
        stream,
        "MESSAGE",
        EventActor::new("agent", "agt_tester"),
        json!({"n": n}),
        None,
    )
    .unwrap()
    .finalize(prev, None)
    .unwrap()
}

fn outbox_entry(id: &str) -> OutboxEntry {
    OutboxEntry {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        artifact_kind: "InvoiceBundle".to_string(),
        artifact_id: "inv-1".to_string(),
        destination_id: "dest-1".to_string(),
        created_at: "2026-02-02T00:00:00.000Z".to_string(),
        attempts: 0,
        next_attempt_at: "2026-02-02T00:00:00.000Z".to_string(),
        state: OutboxState::Pending,
        idempotency_key: format!("idem-{id}"),
        last_error: None,
        lease_deadline: None,
    }
}

#[test]
fn append_links_and_snapshots() {
    for (name, store) in drivers() {
        let e1 = event("s1", None, 1);
        let out1 = store.append_event(TENANT, &e1, None, None).unwrap();
        assert_eq!(out1.stream_snapshot.event_count, 1, "{name}");
        assert_eq!(
            out1.stream_snapshot.last_chain_hash.as_deref(),
            Some(e1.chain_hash.as_str())
        );

        let e2 = event("s1", Some(e1.chain_hash.clone()), 2);
        let out2 = store
            .append_event(TENANT, &e2, Some(&e1.chain_hash), None)
            .unwrap();
        assert_eq!(out2.stream_snapshot.event_count, 2, "{name}");

        let events = store.list_events(TENANT, "s1", None, None).unwrap();
        assert_eq!(events.len(), 2, "{name}");
        assert!(settld_chain::verify_chain(&events).is_ok(), "{name}");
    }
}

#[test]
fn conflict_carries_server_head() {
    for (name, store) in drivers() {
        let e1 = event("s1", None, 1);
        store.append_event(TENANT, &e1, None, None).unwrap();

        let e2 = event("s1", Some(e1.chain_hash.clone()), 2);
        let wrong = "0".repeat(64);
        let err = store
            .append_event(TENANT, &e2, Some(&wrong), None)
            .unwrap_err();
        match err {
            StoreError::Conflict {
                actual_prev_chain_hash,
            } => {
                assert_eq!(
                    actual_prev_chain_hash.as_deref(),
                    Some(e1.chain_hash.as_str()),
                    "{name}"
                );
            }
            other => panic!("{name}: expected conflict, got {other:?}"),
        }

        // Retrying with the server's head succeeds.
        store
            .append_event(TENANT, &e2, Some(&e1.chain_hash), None)
            .unwrap();
    }
}

#[test]
fn idempotent_append_returns_prior_event() {
    for (name, store) in drivers() {
        let e1 = event("s1", None, 1);
        let out1 = store
            .append_event(TENANT, &e1, None, Some("idem-key"))
            .unwrap();
        assert!(!out1.deduped, "{name}");

        // A replay with the same key returns the first event and produces no
        // new state, even though the submitted event differs.
        let e_dup = event("s1", Some(e1.chain_hash.clone()), 99);
        let out2 = store
            .append_event(TENANT, &e_dup, None, Some("idem-key"))
            .unwrap();
        assert!(out2.deduped, "{name}");
        assert_eq!(out2.event.id, e1.id, "{name}");
        assert_eq!(out2.stream_snapshot.event_count, 1, "{name}");
        assert_eq!(store.list_events(TENANT, "s1", None, None).unwrap().len(), 1);
    }
}

#[test]
fn tampered_event_is_rejected() {
    for (name, store) in drivers() {
        let mut e1 = event("s1", None, 1);
        e1.payload = json!({"n": 42});
        let err = store.append_event(TENANT, &e1, None, None).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityInvalid { .. }), "{name}");
    }
}

#[test]
fn signed_append_requires_active_key() {
    for (name, store) in drivers() {
        let kp = settld_crypto::Keypair::generate().unwrap();
        let signed = ChainedEventDraft::new(
            "s1",
            "MESSAGE",
            EventActor::new("agent", "agt_signer"),
            json!({"m": 1}),
            None,
        )
        .unwrap()
        .finalize(None, Some(&kp))
        .unwrap();

        // Unknown signer key.
        let err = store.append_event(TENANT, &signed, None, None).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityInvalid { .. }), "{name}");

        // Revoked key.
        store
            .put_auth_key(
                TENANT,
                &AuthKeyRecord {
                    key_id: kp.key_id().to_string(),
                    public_key_pem: kp.public_key_pem().to_string(),
                    status: KeyStatus::Revoked,
                    agent_id: Some("agt_signer".to_string()),
                },
            )
            .unwrap();
        let err = store.append_event(TENANT, &signed, None, None).unwrap_err();
        assert!(matches!(err, StoreError::SignerKeyNotActive { .. }), "{name}");

        // Active key verifies.
        store
            .put_auth_key(
                TENANT,
                &AuthKeyRecord {
                    key_id: kp.key_id().to_string(),
                    public_key_pem: kp.public_key_pem().to_string(),
                    status: KeyStatus::Active,
                    agent_id: Some("agt_signer".to_string()),
                },
            )
            .unwrap();
        store.append_event(TENANT, &signed, None, None).unwrap();
    }
}

#[test]
fn list_events_since_and_limit() {
    for (name, store) in drivers() {
        let e1 = event("s1", None, 1);
        let e2 = event("s1", Some(e1.chain_hash.clone()), 2);
        let e3 = event("s1", Some(e2.chain_hash.clone()), 3);
        for e in [&e1, &e2, &e3] {
            store.append_event(TENANT, e, None, None).unwrap();
        }
        let tail = store
            .list_events(TENANT, "s1", Some(&e1.id), None)
            .unwrap();
        assert_eq!(tail.len(), 2, "{name}");
        assert_eq!(tail[0].id, e2.id, "{name}");

        let limited = store.list_events(TENANT, "s1", None, Some(1)).unwrap();
        assert_eq!(limited.len(), 1, "{name}");
        assert_eq!(limited[0].id, e1.id, "{name}");
    }
}

#[test]
fn tenants_are_isolated() {
    for (name, store) in drivers() {
        let e1 = event("s1", None, 1);
        store.append_event("tenant-a", &e1, None, None).unwrap();
        assert!(
            store
                .get_stream_snapshot("tenant-b", "s1")
                .unwrap()
                .is_none(),
            "{name}"
        );
        assert!(store.list_events("tenant-b", "s1", None, None).unwrap().is_empty());
    }
}

#[test]
fn artifacts_are_immutable() {
    for (name, store) in drivers() {
        let record = ArtifactRecord {
            kind: "InvoiceBundle".to_string(),
            id: "inv-1".to_string(),
            created_at: "2026-02-02T00:00:00.000Z".to_string(),
            body: json!({"schemaVersion": "InvoiceBundle.v1"}),
        };
        store.put_artifact(TENANT, &record).unwrap();
        let err = store.put_artifact(TENANT, &record).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }), "{name}");

        let got = store
            .get_artifact(TENANT, "InvoiceBundle", "inv-1")
            .unwrap()
            .unwrap();
        assert_eq!(got.body, record.body, "{name}");

        let listed = store
            .list_artifacts(
                TENANT,
                &ArtifactFilter {
                    kind: Some("InvoiceBundle".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(listed.len(), 1, "{name}");
    }
}

#[test]
fn outbox_lease_ack_cycle() {
    for (name, store) in drivers() {
        store.enqueue_outbox(TENANT, &outbox_entry("obx_1")).unwrap();
        store.enqueue_outbox(TENANT, &outbox_entry("obx_2")).unwrap();

        let leased = store
            .lease_outbox(TENANT, 10, "2026-02-02T00:00:01.000Z", "2026-02-02T00:01:00.000Z")
            .unwrap();
        assert_eq!(leased.len(), 2, "{name}");
        assert!(leased.iter().all(|e| e.state == OutboxState::Leased));
        assert!(leased.iter().all(|e| e.attempts == 1), "{name}");

        // Leased entries are not re-leased before their deadline.
        let again = store
            .lease_outbox(TENANT, 10, "2026-02-02T00:00:02.000Z", "2026-02-02T00:01:00.000Z")
            .unwrap();
        assert!(again.is_empty(), "{name}");

        // Expired leases become re-leasable.
        let relea = store
            .lease_outbox(TENANT, 10, "2026-02-02T00:02:00.000Z", "2026-02-02T00:03:00.000Z")
            .unwrap();
        assert_eq!(relea.len(), 2, "{name}");
        assert!(relea.iter().all(|e| e.attempts == 2), "{name}");

        store
            .ack_outbox(TENANT, "obx_1", &OutboxAck::Delivered)
            .unwrap();
        store
            .ack_outbox(
                TENANT,
                "obx_2",
                &OutboxAck::Retry {
                    error: "DELIVERY_HTTP_ERROR: 503".to_string(),
                    next_attempt_at: "2026-02-02T00:05:00.000Z".to_string(),
                },
            )
            .unwrap();

        let e1 = store.get_outbox(TENANT, "obx_1").unwrap().unwrap();
        assert_eq!(e1.state, OutboxState::Delivered, "{name}");
        let e2 = store.get_outbox(TENANT, "obx_2").unwrap().unwrap();
        assert_eq!(e2.state, OutboxState::Pending, "{name}");
        assert_eq!(e2.next_attempt_at, "2026-02-02T00:05:00.000Z", "{name}");

        // Idempotency key is stable across the whole cycle.
        assert_eq!(e2.idempotency_key, "idem-obx_2", "{name}");

        store
            .ack_outbox(TENANT, "obx_2", &OutboxAck::Dlq { error: "max attempts".into() })
            .unwrap();
        let e2 = store.get_outbox(TENANT, "obx_2").unwrap().unwrap();
        assert_eq!(e2.state, OutboxState::Dlq, "{name}");
    }
}

#[test]
fn idempotency_records_expire() {
    use chrono::{TimeZone, Utc};
    use settld_store::FixedClock;
    use std::sync::Arc;

    let t0 = Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap();
    let store = MemoryStore::with_clock(Arc::new(FixedClock(t0)));
    store
        .put_idempotency(TENANT, "live", &json!({"ok": true}), 60)
        .unwrap();
    assert!(store.get_idempotency(TENANT, "live").unwrap().is_some());

    // A zero TTL expires immediately under the same clock.
    store.put_idempotency(TENANT, "dead", &json!(1), 0).unwrap();
    assert!(store.get_idempotency(TENANT, "dead").unwrap().is_none());
}

#[test]
fn ops_audit_appends_in_order() {
    for (name, store) in drivers() {
        for i in 0..3 {
            store
                .put_ops_audit(
                    TENANT,
                    &settld_store::OpsAuditRecord {
                        id: format!("audit-{i}"),
                        at: format!("2026-02-02T00:00:0{i}.000Z"),
                        actor: "operator".to_string(),
                        action: "trust.reload".to_string(),
                        details: json!({"i": i}),
                    },
                )
                .unwrap();
        }
        let records = store.list_ops_audit(TENANT).unwrap();
        assert_eq!(records.len(), 3, "{name}");
        assert_eq!(records[0].id, "audit-0", "{name}");
        assert_eq!(records[2].id, "audit-2", "{name}");
    }
}
