// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end delivery tests against a mock webhook endpoint.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use settld_crypto::webhook_signature;
use settld_outbox::{enqueue_artifact, DeliveryWorker, Destination, RetryPolicy};
use settld_store::{ArtifactRecord, MemoryStore, OutboxState, Store};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const TENANT: &str = "tenant-a";

fn policy() -> RetryPolicy {
    RetryPolicy {
        base_delay_ms: 10,
        cap_delay_ms: 50,
        jitter_band_ms: 0,
        max_attempts: 3,
        lease_secs: 60,
        delivery_timeout_secs: 2,
    }
}

fn seed(store: &dyn Store) -> String {
    store
        .put_artifact(
            TENANT,
            &ArtifactRecord {
                kind: "InvoiceBundle".to_string(),
                id: "inv-1".to_string(),
                created_at: store.now_iso(),
                body: json!({"schemaVersion": "InvoiceBundle.v1", "invoiceCore": {"totalCents": 100}}),
            },
        )
        .unwrap();
    let entries = enqueue_artifact(store, TENANT, "InvoiceBundle", "inv-1", &["hook".to_string()])
        .unwrap();
    entries[0].id.clone()
}

fn worker(store: Arc<dyn Store>, url: String) -> DeliveryWorker {
    let mut destinations = BTreeMap::new();
    destinations.insert(
        "hook".to_string(),
        Destination {
            url,
            secret: "shhh".to_string(),
        },
    );
    DeliveryWorker::new(store, destinations, policy())
}

#[tokio::test]
async fn delivers_with_signed_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("x-tenant-id", TENANT))
        .and(header("x-artifact-type", "InvoiceBundle"))
        .and(header("x-artifact-id", "inv-1"))
        .and(header_exists("x-idempotency-key"))
        .and(header_exists("x-signature"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let entry_id = seed(store.as_ref());
    let w = worker(store.clone(), format!("{}/hooks", server.uri()));

    let stats = w.run_once(TENANT, 10).await.unwrap();
    assert_eq!(stats.leased, 1);
    assert_eq!(stats.delivered, 1);

    let entry = store.get_outbox(TENANT, &entry_id).unwrap().unwrap();
    assert_eq!(entry.state, OutboxState::Delivered);
}

#[tokio::test]
async fn signature_covers_canonical_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    seed(store.as_ref());
    let w = worker(store.clone(), server.uri());
    w.run_once(TENANT, 10).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let req: &Request = &requests[0];
    let sig = req.headers.get("x-signature").unwrap().to_str().unwrap();
    let expected = webhook_signature(b"shhh", &req.body);
    assert_eq!(sig, expected);
}

#[tokio::test]
async fn http_error_schedules_retry_with_stable_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let entry_id = seed(store.as_ref());
    let w = worker(store.clone(), server.uri());

    let before = store.get_outbox(TENANT, &entry_id).unwrap().unwrap();
    let stats = w.run_once(TENANT, 10).await.unwrap();
    assert_eq!(stats.retried, 1);

    let after = store.get_outbox(TENANT, &entry_id).unwrap().unwrap();
    assert_eq!(after.state, OutboxState::Pending);
    assert_eq!(after.attempts, 1);
    assert_eq!(after.idempotency_key, before.idempotency_key);
    assert!(after
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("DELIVERY_HTTP_ERROR"));
}

#[tokio::test]
async fn exhausted_retries_park_on_dlq() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let entry_id = seed(store.as_ref());
    let w = worker(store.clone(), server.uri());

    // max_attempts = 3; the backoff is short enough that each pass re-leases.
    for _ in 0..4 {
        w.run_once(TENANT, 10).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    }

    let entry = store.get_outbox(TENANT, &entry_id).unwrap().unwrap();
    assert_eq!(entry.state, OutboxState::Dlq);
    assert!(entry
        .last_error
        .as_deref()
        .unwrap()
        .contains("DELIVERY_MAX_ATTEMPTS_EXCEEDED"));
}

#[tokio::test]
async fn unknown_destination_is_dead_lettered_without_retry() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .put_artifact(
            TENANT,
            &ArtifactRecord {
                kind: "InvoiceBundle".to_string(),
                id: "inv-2".to_string(),
                created_at: store.now_iso(),
                body: json!({}),
            },
        )
        .unwrap();
    let entries = enqueue_artifact(
        store.as_ref(),
        TENANT,
        "InvoiceBundle",
        "inv-2",
        &["nowhere".to_string()],
    )
    .unwrap();

    let w = DeliveryWorker::new(store.clone(), BTreeMap::new(), policy());
    let stats = w.run_once(TENANT, 10).await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    let entry = store.get_outbox(TENANT, &entries[0].id).unwrap().unwrap();
    assert_eq!(entry.state, OutboxState::Dlq);
}
