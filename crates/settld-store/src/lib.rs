// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tenant-scoped persistence for the settlement substrate.
//!
//! The [`Store`] trait is the only writer of persistent state. Callers always
//! receive owned deep copies; read-modify-write sequences (event appends,
//! outbox leases, idempotent replays) happen inside the driver under a mutex
//! or a transaction. Two drivers implement the contract: [`MemoryStore`] and
//! [`SqliteStore`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// In-memory driver backed by mutex-guarded maps.
pub mod memory;
/// Relational driver backed by SQLite.
pub mod sqlite;

mod checks;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use settld_chain::{ChainedEvent, StreamSnapshot};
use settld_error::{ErrorCode, SettldError};

pub use checks::validate_append;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Injectable time source so tests can pin `now`.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Current instant as RFC-3339 UTC with millisecond precision.
    fn now_iso(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A persisted artifact, keyed by `(kind, id)` within a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    /// Artifact kind tag (e.g. `"SessionReplayPack"`).
    pub kind: String,
    /// Artifact id.
    pub id: String,
    /// When the artifact was persisted.
    pub created_at: String,
    /// The full artifact JSON.
    pub body: Value,
}

/// Filter for [`Store::list_artifacts`].
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    /// Restrict to one kind.
    pub kind: Option<String>,
    /// Only artifacts created at or after this instant.
    pub since: Option<String>,
    /// Maximum number of records returned.
    pub limit: Option<usize>,
}

/// Lifecycle status of an auth key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Key may sign.
    Active,
    /// Key was rotated out; signatures no longer accepted.
    Rotated,
    /// Key was revoked; signatures no longer accepted.
    Revoked,
}

/// A registered signer key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthKeyRecord {
    /// Derived `ed25519:<hex32>` key id.
    pub key_id: String,
    /// SPKI public key PEM.
    pub public_key_pem: String,
    /// Lifecycle status.
    pub status: KeyStatus,
    /// Owning agent, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// A stored idempotency outcome, TTL-bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// Caller-supplied key.
    pub key: String,
    /// The outcome to replay.
    pub outcome: Value,
    /// When the record was stored.
    pub stored_at: String,
    /// When the record expires.
    pub expires_at: String,
}

/// An operator-visible audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsAuditRecord {
    /// Record id.
    pub id: String,
    /// When the action happened.
    pub at: String,
    /// Who performed it.
    pub actor: String,
    /// Action tag.
    pub action: String,
    /// Structured details.
    pub details: Value,
}

// ---------------------------------------------------------------------------
// Outbox rows
// ---------------------------------------------------------------------------

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    /// Waiting for its next attempt.
    Pending,
    /// Held by a worker under a lease deadline.
    Leased,
    /// Delivered successfully.
    Delivered,
    /// Failed terminally on a non-retryable error.
    Failed,
    /// Retries exhausted; parked on the dead-letter queue.
    Dlq,
}

/// One pending delivery co-located with the domain write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Entry id (`obx_…`).
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Artifact kind being delivered.
    pub artifact_kind: String,
    /// Artifact id being delivered.
    pub artifact_id: String,
    /// Destination identifier (resolves to a URL + secret in config).
    pub destination_id: String,
    /// When the entry was enqueued.
    pub created_at: String,
    /// Attempts made so far.
    pub attempts: u32,
    /// Earliest instant of the next attempt.
    pub next_attempt_at: String,
    /// Current state.
    pub state: OutboxState,
    /// Stable idempotency key, minted once per entry so receivers dedupe
    /// across retries.
    pub idempotency_key: String,
    /// Last delivery error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Lease deadline while [`OutboxState::Leased`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_deadline: Option<String>,
}

/// How a worker resolves a leased outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboxAck {
    /// Delivered; entry is terminal.
    Delivered,
    /// Transient failure; retry at `next_attempt_at`.
    Retry {
        /// Delivery error description.
        error: String,
        /// When to attempt next.
        next_attempt_at: String,
    },
    /// Retries exhausted or error was not retryable; park on the DLQ.
    Dlq {
        /// Terminal error description.
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller's expected previous chain hash does not match the head.
    /// Carries the server's view so clients can retry without re-reading.
    #[error("OPTIMISTIC_CONCURRENCY_CONFLICT: stream head is {actual_prev_chain_hash:?}")]
    Conflict {
        /// The server's current head chain hash.
        actual_prev_chain_hash: Option<String>,
    },

    /// The event failed hash, linkage, or signature checks.
    #[error("EVENT_INTEGRITY_INVALID: {reason}")]
    IntegrityInvalid {
        /// What failed.
        reason: String,
    },

    /// The event's signer key is not active.
    #[error("SIGNER_KEY_NOT_ACTIVE: {key_id}")]
    SignerKeyNotActive {
        /// The offending key id.
        key_id: String,
    },

    /// A uniqueness constraint was violated (duplicate id).
    #[error("duplicate {what}: {id}")]
    Duplicate {
        /// What kind of record collided.
        what: &'static str,
        /// The colliding id.
        id: String,
    },

    /// The requested record does not exist.
    #[error("not found: {what} {id}")]
    NotFound {
        /// What kind of record was requested.
        what: &'static str,
        /// The missing id.
        id: String,
    },

    /// Driver-level failure (SQL, serialization).
    #[error("storage failure: {reason}")]
    Storage {
        /// Driver detail.
        reason: String,
    },
}

impl From<StoreError> for SettldError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                actual_prev_chain_hash,
            } => SettldError::new(
                ErrorCode::OptimisticConcurrencyConflict,
                "expected previous chain hash does not match the stream head",
            )
            .with_detail("expectedPrevChainHash", actual_prev_chain_hash),
            StoreError::IntegrityInvalid { reason } => {
                SettldError::new(ErrorCode::EventIntegrityInvalid, reason)
            }
            StoreError::SignerKeyNotActive { key_id } => {
                SettldError::new(ErrorCode::SignerKeyNotActive, "signer key is not active")
                    .with_detail("signerKeyId", key_id)
            }
            StoreError::Duplicate { what, id } => {
                SettldError::new(ErrorCode::SchemaInvalid, format!("duplicate {what}"))
                    .with_detail("id", id)
            }
            StoreError::NotFound { what, id } => {
                SettldError::new(ErrorCode::SchemaInvalid, format!("unknown {what}"))
                    .with_detail("id", id)
            }
            StoreError::Storage { reason } => SettldError::new(ErrorCode::Internal, reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Append outcome
// ---------------------------------------------------------------------------

/// Result of a successful (or idempotently replayed) append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendOutcome {
    /// The persisted event.
    pub event: ChainedEvent,
    /// The stream head after the append.
    pub stream_snapshot: StreamSnapshot,
    /// `true` when a prior event with the same idempotency key was returned
    /// and no new state was produced.
    pub deduped: bool,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// The tenant-scoped persistence contract.
///
/// All operations take the tenant first. Appends are atomic with their
/// snapshot update; leases are atomic with their state transition.
pub trait Store: Send + Sync {
    /// Current time from the injected clock.
    fn now_iso(&self) -> String;

    // -- Events ----------------------------------------------------------

    /// Append a chained event under the per-stream guard.
    ///
    /// Implements the append algorithm: conflict check against
    /// `expected_prev`, idempotent replay on `idempotency_key`, integrity
    /// recompute, signer key check, and atomic persist + snapshot update.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`], [`StoreError::IntegrityInvalid`],
    /// [`StoreError::SignerKeyNotActive`], or [`StoreError::Storage`].
    fn append_event(
        &self,
        tenant_id: &str,
        event: &ChainedEvent,
        expected_prev: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<AppendOutcome, StoreError>;

    /// List a stream's events in append order.
    ///
    /// `since_event_id` skips everything up to and including that event.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn list_events(
        &self,
        tenant_id: &str,
        stream_id: &str,
        since_event_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<ChainedEvent>, StoreError>;

    /// Current head of a stream, if the stream exists.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn get_stream_snapshot(
        &self,
        tenant_id: &str,
        stream_id: &str,
    ) -> Result<Option<StreamSnapshot>, StoreError>;

    // -- Artifacts -------------------------------------------------------

    /// Persist an artifact. Artifacts are immutable: a second put with the
    /// same `(kind, id)` is rejected.
    ///
    /// # Errors
    ///
    /// [`StoreError::Duplicate`] or [`StoreError::Storage`].
    fn put_artifact(&self, tenant_id: &str, record: &ArtifactRecord) -> Result<(), StoreError>;

    /// Fetch one artifact by kind and id.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn get_artifact(
        &self,
        tenant_id: &str,
        kind: &str,
        id: &str,
    ) -> Result<Option<ArtifactRecord>, StoreError>;

    /// List artifacts matching a filter, newest first.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn list_artifacts(
        &self,
        tenant_id: &str,
        filter: &ArtifactFilter,
    ) -> Result<Vec<ArtifactRecord>, StoreError>;

    // -- Auth keys -------------------------------------------------------

    /// Register or update a signer key.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn put_auth_key(&self, tenant_id: &str, record: &AuthKeyRecord) -> Result<(), StoreError>;

    /// Look up a signer key by id.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn lookup_auth_key(
        &self,
        tenant_id: &str,
        key_id: &str,
    ) -> Result<Option<AuthKeyRecord>, StoreError>;

    // -- Idempotency -----------------------------------------------------

    /// Store an idempotency outcome with a TTL.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn put_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
        outcome: &Value,
        ttl_secs: u64,
    ) -> Result<(), StoreError>;

    /// Fetch an unexpired idempotency outcome.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn get_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    // -- Outbox ----------------------------------------------------------

    /// Enqueue a delivery.
    ///
    /// # Errors
    ///
    /// [`StoreError::Duplicate`] or [`StoreError::Storage`].
    fn enqueue_outbox(&self, tenant_id: &str, entry: &OutboxEntry) -> Result<(), StoreError>;

    /// Atomically lease up to `n` due entries (pending and past
    /// `next_attempt_at`, or leased with an expired lease), marking each
    /// leased until `lease_deadline`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn lease_outbox(
        &self,
        tenant_id: &str,
        n: usize,
        now: &str,
        lease_deadline: &str,
    ) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Resolve a leased entry.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] or [`StoreError::Storage`].
    fn ack_outbox(&self, tenant_id: &str, entry_id: &str, ack: &OutboxAck)
        -> Result<(), StoreError>;

    /// Fetch one outbox entry (diagnostics and tests).
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn get_outbox(
        &self,
        tenant_id: &str,
        entry_id: &str,
    ) -> Result<Option<OutboxEntry>, StoreError>;

    // -- Ops audit -------------------------------------------------------

    /// Append an ops audit record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn put_ops_audit(&self, tenant_id: &str, record: &OpsAuditRecord) -> Result<(), StoreError>;

    /// List ops audit records in append order.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    fn list_ops_audit(&self, tenant_id: &str) -> Result<Vec<OpsAuditRecord>, StoreError>;
}
