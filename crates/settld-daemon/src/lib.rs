// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control plane.
//!
//! Three routes: event append, bundle ingest, and health. Handlers translate
//! typed substrate errors into the stable error-body shape
//! `{code, message, details}` with the taxonomy's status mapping (400
//! schema, 401/403 auth, 409 conflict, 410 lifecycle, 429 throttle).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use settld_canon::ids::magic_link_token_from_digest;
use settld_canon::sha256_hex;
use settld_chain::{ChainedEventDraft, EventActor};
use settld_config::SettldConfig;
use settld_error::{ErrorCode, SettldError};
use settld_store::{ArtifactRecord, Store, StoreError};
use settld_telemetry::MetricsCollector;

/// Header carrying the tenant id.
pub const HEADER_TENANT: &str = "x-proxy-tenant-id";
/// Header carrying the append idempotency key.
pub const HEADER_IDEMPOTENCY: &str = "x-idempotency-key";
/// Header carrying the caller's expected previous chain hash.
pub const HEADER_EXPECTED_PREV: &str = "x-proxy-expected-prev-chain-hash";

/// Shared daemon state.
pub struct AppState {
    /// The store.
    pub store: Arc<dyn Store>,
    /// Config snapshot taken at startup.
    pub config: Arc<SettldConfig>,
    /// Metrics collector.
    pub metrics: MetricsCollector,
    /// Startup instant for uptime reporting.
    pub started_at: Instant,
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/streams/{stream}/events", post(append_event))
        .route("/v1/ingest/{tenant}", post(ingest))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error body
// ---------------------------------------------------------------------------

struct ApiError(SettldError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "code": self.0.code.as_str(),
            "message": self.0.message,
        });
        if !self.0.details.is_empty() {
            body["details"] = json!(self.0.details);
        }
        (status, Json(body)).into_response()
    }
}

impl From<SettldError> for ApiError {
    fn from(err: SettldError) -> Self {
        Self(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err.into())
    }
}

fn require_tenant(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(HEADER_TENANT)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError(SettldError::new(
                ErrorCode::AuthKeyMissing,
                format!("missing {HEADER_TENANT} header"),
            ))
        })
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && *v != "null")
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Event append
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendRequest {
    #[serde(rename = "type")]
    event_type: String,
    actor: ActorBody,
    #[serde(default)]
    payload: Value,
    at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActorBody {
    #[serde(rename = "type")]
    actor_type: String,
    id: String,
}

async fn append_event(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AppendRequest>,
) -> Result<Response, ApiError> {
    let tenant = require_tenant(&headers)?;
    let expected_prev = header_value(&headers, HEADER_EXPECTED_PREV).map(str::to_string);
    let idempotency_key = header_value(&headers, HEADER_IDEMPOTENCY).map(str::to_string);

    // The head is read outside the append lock, so an unguarded append can
    // race a concurrent writer; a short retry re-reads the head. A
    // client-guarded append never retries — the conflict is the contract.
    let mut last_err: Option<StoreError> = None;
    for _ in 0..3 {
        let head = state
            .store
            .get_stream_snapshot(&tenant, &stream)?
            .and_then(|s| s.last_chain_hash);

        if let Some(expected) = expected_prev.as_deref()
            && Some(expected) != head.as_deref()
        {
            return Err(StoreError::Conflict {
                actual_prev_chain_hash: head,
            }
            .into());
        }

        let event = ChainedEventDraft::new(
            stream.clone(),
            body.event_type.clone(),
            EventActor::new(body.actor.actor_type.clone(), body.actor.id.clone()),
            body.payload.clone(),
            body.at.clone(),
        )
        .map_err(|e| SettldError::new(ErrorCode::SchemaInvalid, e.to_string()))?
        .finalize(head, None)
        .map_err(|e| SettldError::new(ErrorCode::Internal, e.to_string()))?;

        match state.store.append_event(
            &tenant,
            &event,
            expected_prev.as_deref(),
            idempotency_key.as_deref(),
        ) {
            Ok(outcome) => {
                info!(%tenant, %stream, event = %outcome.event.id, deduped = outcome.deduped, "append");
                state.metrics.record_append(settld_telemetry::AppendSample {
                    stream_id: stream.clone(),
                    duration_ms: 0,
                    ok: true,
                    conflict: false,
                });
                return Ok((
                    StatusCode::CREATED,
                    Json(json!({
                        "event": outcome.event,
                        "streamSnapshot": outcome.stream_snapshot,
                    })),
                )
                    .into_response());
            }
            Err(StoreError::IntegrityInvalid { reason })
                if expected_prev.is_none() && reason.contains("stream head") =>
            {
                // Lost an unguarded race; re-read and retry.
                last_err = Some(StoreError::IntegrityInvalid { reason });
            }
            Err(e) => {
                if matches!(e, StoreError::Conflict { .. }) {
                    state.metrics.record_append(settld_telemetry::AppendSample {
                        stream_id: stream.clone(),
                        duration_ms: 0,
                        ok: false,
                        conflict: true,
                    });
                }
                return Err(e.into());
            }
        }
    }
    Err(last_err
        .map(ApiError::from)
        .unwrap_or_else(|| ApiError(SettldError::new(ErrorCode::Internal, "append retry failed"))))
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

async fn ingest(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let config = &state.config;

    if !config.ingest.keys.is_empty() {
        let supplied = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match supplied {
            None => {
                return Err(ApiError(SettldError::new(
                    ErrorCode::AuthKeyMissing,
                    "ingest requires a bearer key",
                )))
            }
            Some(key) if !config.ingest.keys.iter().any(|k| k == key) => {
                return Err(ApiError(SettldError::new(
                    ErrorCode::SignerNotTrusted,
                    "ingest key not recognized",
                )))
            }
            Some(_) => {}
        }
    }

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/zip" {
        return Err(ApiError(
            SettldError::new(ErrorCode::SchemaInvalid, "content-type must be application/zip")
                .with_detail("contentType", content_type),
        ));
    }
    if body.len() as u64 > config.ingest.max_zip_bytes {
        return Err(ApiError(
            SettldError::new(ErrorCode::ZipBudgetExceeded, "upload exceeds maxZipBytes")
                .with_detail("zipBytes", body.len())
                .with_detail("maxZipBytes", config.ingest.max_zip_bytes),
        ));
    }

    // Reject structurally unsafe archives before accepting the upload.
    settld_bundle::safe_unzip(&body, &settld_bundle::UnzipBudget::default()).map_err(|e| {
        ApiError(SettldError::new(
            match e {
                settld_bundle::ZipError::BudgetExceeded { .. } => ErrorCode::ZipBudgetExceeded,
                _ => ErrorCode::ZipUnsafeEntry,
            },
            e.to_string(),
        ))
    })?;

    let zip_sha256 = sha256_hex(&body);
    // Content-derived token: identical bytes for a tenant land on the same
    // token, which is what drives dedup.
    let token = magic_link_token_from_digest(&sha256_hex(format!("{tenant}:{zip_sha256}").as_bytes()));
    let mode = params.get("mode").map(String::as_str);
    let mode_resolved = match mode {
        Some("record") => "record",
        _ => "verify",
    };
    let rerun = matches!(params.get("rerun").map(String::as_str), Some("true" | "1"));

    let deduped = state
        .store
        .get_artifact(&tenant, "IngestBundle", &token)?
        .is_some();
    if !deduped {
        state.store.put_artifact(
            &tenant,
            &ArtifactRecord {
                kind: "IngestBundle".to_string(),
                id: token.clone(),
                created_at: state.store.now_iso(),
                body: json!({
                    "token": token,
                    "zipSha256": zip_sha256,
                    "zipBytes": body.len(),
                    "modeResolved": mode_resolved,
                }),
            },
        )?;
    }

    info!(%tenant, %token, deduped, "ingest");
    Ok((
        StatusCode::OK,
        Json(json!({
            "token": token,
            "url": format!("/v1/bundles/{token}"),
            "zipSha256": zip_sha256,
            "zipBytes": body.len(),
            "modeResolved": mode_resolved,
            "deduped": deduped,
            "rerun": rerun,
        })),
    )
        .into_response())
}
