// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the settlement
//! substrate.
//!
//! Every substrate error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag emitted verbatim in artifacts and APIs), a human-readable
//! message, an optional cause chain, and arbitrary key-value details. Use the
//! builder returned by [`SettldError::new`] to construct errors fluently.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Request/payload schema errors.
    Schema,
    /// Authentication and signer-trust errors.
    Auth,
    /// Event chain and append errors.
    Chain,
    /// Artifact hash/binding errors.
    Artifact,
    /// x402 payment-gate errors.
    Gate,
    /// Session substrate errors.
    Session,
    /// Outbox delivery errors.
    Delivery,
    /// Deterministic ZIP errors.
    Zip,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Schema => "schema",
            Self::Auth => "auth",
            Self::Chain => "chain",
            Self::Artifact => "artifact",
            Self::Gate => "gate",
            Self::Session => "session",
            Self::Delivery => "delivery",
            Self::Zip => "zip",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases. These strings appear
/// verbatim in verification reports, API error bodies, and DLQ records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Schema --
    /// Input failed structural validation.
    SchemaInvalid,
    /// A `schemaVersion` string did not match the expected constant.
    UnsupportedSchemaVersion,
    /// A value cannot be represented in canonical JSON.
    CanonicalJsonUnsupportedValue,

    // -- Auth --
    /// No auth key was supplied where one is required.
    AuthKeyMissing,
    /// A signature verified, but the signer is not in the trust file.
    SignerNotTrusted,
    /// The signer key exists but is rotated or revoked.
    SignerKeyNotActive,

    // -- Chain / append --
    /// The caller's expected previous chain hash does not match the stream head.
    OptimisticConcurrencyConflict,
    /// Recomputed event hashes or signature do not match the event.
    EventIntegrityInvalid,
    /// Linear chain verification found a mismatch at some index.
    ChainBroken,

    // -- Artifact --
    /// A sealed artifact's stored hash does not match its recomputed core hash.
    ArtifactHashMismatch,
    /// Two hash-bound artifacts disagree about shared content.
    CrossArtifactBindingMismatch,
    /// Strict-artifact cross-validation of a conformance pair failed.
    ConformanceStrictArtifactValidationFailed,

    // -- x402 gate --
    /// Provider attestation signature failed against the pinned key.
    X402ProviderSignatureInvalid,
    /// An `http_request` verification carried no request-hash evidence ref.
    X402ReversalBindingEvidenceRequired,
    /// Evidence refs conflict with the reversal binding.
    X402ReversalBindingEvidenceMismatch,
    /// Participant lifecycle is `suspended`.
    X402AgentSuspended,
    /// Participant lifecycle is `throttled`.
    X402AgentThrottled,
    /// The agent's signer key is not active.
    X402AgentSignerKeyInvalid,

    // -- Session --
    /// Replay pack chain bytes do not verify.
    SessionReplayChainInvalid,
    /// Recomputed provenance taint disagrees with recorded taint.
    SessionReplayProvenanceInvalid,
    /// Concurrent session appends raced on the event cursor.
    SessionEventCursorConflict,

    // -- Delivery --
    /// Webhook endpoint returned a non-2xx status.
    DeliveryHttpError,
    /// Webhook delivery timed out.
    DeliveryTimeout,
    /// Delivery attempts exhausted; entry moved to the DLQ.
    DeliveryMaxAttemptsExceeded,

    // -- ZIP --
    /// An unzip budget (entries, path, file, total, ratio) was exceeded.
    ZipBudgetExceeded,
    /// An archive entry is unsafe (absolute path, `..`, duplicate, non-NFC).
    ZipUnsafeEntry,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SchemaInvalid
            | Self::UnsupportedSchemaVersion
            | Self::CanonicalJsonUnsupportedValue => ErrorCategory::Schema,

            Self::AuthKeyMissing | Self::SignerNotTrusted | Self::SignerKeyNotActive => {
                ErrorCategory::Auth
            }

            Self::OptimisticConcurrencyConflict
            | Self::EventIntegrityInvalid
            | Self::ChainBroken => ErrorCategory::Chain,

            Self::ArtifactHashMismatch
            | Self::CrossArtifactBindingMismatch
            | Self::ConformanceStrictArtifactValidationFailed => ErrorCategory::Artifact,

            Self::X402ProviderSignatureInvalid
            | Self::X402ReversalBindingEvidenceRequired
            | Self::X402ReversalBindingEvidenceMismatch
            | Self::X402AgentSuspended
            | Self::X402AgentThrottled
            | Self::X402AgentSignerKeyInvalid => ErrorCategory::Gate,

            Self::SessionReplayChainInvalid
            | Self::SessionReplayProvenanceInvalid
            | Self::SessionEventCursorConflict => ErrorCategory::Session,

            Self::DeliveryHttpError
            | Self::DeliveryTimeout
            | Self::DeliveryMaxAttemptsExceeded => ErrorCategory::Delivery,

            Self::ZipBudgetExceeded | Self::ZipUnsafeEntry => ErrorCategory::Zip,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"OPTIMISTIC_CONCURRENCY_CONFLICT"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::UnsupportedSchemaVersion => "UNSUPPORTED_SCHEMA_VERSION",
            Self::CanonicalJsonUnsupportedValue => "CANONICAL_JSON_UNSUPPORTED_VALUE",
            Self::AuthKeyMissing => "AUTH_KEY_MISSING",
            Self::SignerNotTrusted => "SIGNER_NOT_TRUSTED",
            Self::SignerKeyNotActive => "SIGNER_KEY_NOT_ACTIVE",
            Self::OptimisticConcurrencyConflict => "OPTIMISTIC_CONCURRENCY_CONFLICT",
            Self::EventIntegrityInvalid => "EVENT_INTEGRITY_INVALID",
            Self::ChainBroken => "CHAIN_BROKEN",
            Self::ArtifactHashMismatch => "ARTIFACT_HASH_MISMATCH",
            Self::CrossArtifactBindingMismatch => "CROSS_ARTIFACT_BINDING_MISMATCH",
            Self::ConformanceStrictArtifactValidationFailed => {
                "CONFORMANCE_STRICT_ARTIFACT_VALIDATION_FAILED"
            }
            Self::X402ProviderSignatureInvalid => "X402_PROVIDER_SIGNATURE_INVALID",
            Self::X402ReversalBindingEvidenceRequired => {
                "X402_REVERSAL_BINDING_EVIDENCE_REQUIRED"
            }
            Self::X402ReversalBindingEvidenceMismatch => {
                "X402_REVERSAL_BINDING_EVIDENCE_MISMATCH"
            }
            Self::X402AgentSuspended => "X402_AGENT_SUSPENDED",
            Self::X402AgentThrottled => "X402_AGENT_THROTTLED",
            Self::X402AgentSignerKeyInvalid => "X402_AGENT_SIGNER_KEY_INVALID",
            Self::SessionReplayChainInvalid => "SESSION_REPLAY_CHAIN_INVALID",
            Self::SessionReplayProvenanceInvalid => "SESSION_REPLAY_PROVENANCE_INVALID",
            Self::SessionEventCursorConflict => "SESSION_EVENT_CURSOR_CONFLICT",
            Self::DeliveryHttpError => "DELIVERY_HTTP_ERROR",
            Self::DeliveryTimeout => "DELIVERY_TIMEOUT",
            Self::DeliveryMaxAttemptsExceeded => "DELIVERY_MAX_ATTEMPTS_EXCEEDED",
            Self::ZipBudgetExceeded => "ZIP_BUDGET_EXCEEDED",
            Self::ZipUnsafeEntry => "ZIP_UNSAFE_ENTRY",
            Self::Internal => "INTERNAL",
        }
    }

    /// HTTP status the daemon maps this code to.
    ///
    /// 400 schema, 401/403 auth, 409 conflict, 410 lifecycle, 429 throttle;
    /// 5xx is reserved for truly unexpected faults.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::SchemaInvalid
            | Self::UnsupportedSchemaVersion
            | Self::CanonicalJsonUnsupportedValue
            | Self::EventIntegrityInvalid
            | Self::ZipBudgetExceeded
            | Self::ZipUnsafeEntry => 400,
            Self::AuthKeyMissing => 401,
            Self::SignerNotTrusted
            | Self::SignerKeyNotActive
            | Self::X402AgentSignerKeyInvalid => 403,
            Self::OptimisticConcurrencyConflict | Self::SessionEventCursorConflict => 409,
            Self::X402AgentSuspended => 410,
            Self::X402AgentThrottled => 429,
            Self::ChainBroken
            | Self::ArtifactHashMismatch
            | Self::CrossArtifactBindingMismatch
            | Self::ConformanceStrictArtifactValidationFailed
            | Self::SessionReplayChainInvalid
            | Self::SessionReplayProvenanceInvalid
            | Self::X402ProviderSignatureInvalid
            | Self::X402ReversalBindingEvidenceRequired
            | Self::X402ReversalBindingEvidenceMismatch => 422,
            Self::DeliveryHttpError
            | Self::DeliveryTimeout
            | Self::DeliveryMaxAttemptsExceeded => 502,
            Self::Internal => 500,
        }
    }

    /// Returns `true` if a delivery worker should retry on this code.
    ///
    /// Transient I/O failures retry; typed logical failures escalate straight
    /// to the DLQ.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeliveryHttpError | Self::DeliveryTimeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SettldError
// ---------------------------------------------------------------------------

/// Unified substrate error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and structured details that handlers
/// surface verbatim (e.g. `expectedPrevChainHash` on a 409).
///
/// # Builder usage
///
/// ```
/// use settld_error::{ErrorCode, SettldError};
///
/// let err = SettldError::new(ErrorCode::OptimisticConcurrencyConflict, "stream head moved")
///     .with_detail("expectedPrevChainHash", "ab".repeat(32));
/// assert_eq!(err.code.as_str(), "OPTIMISTIC_CONCURRENCY_CONFLICT");
/// ```
pub struct SettldError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Structured details for API payloads and diagnostics.
    pub details: BTreeMap<String, serde_json::Value>,
}

impl SettldError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            details: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the structured details.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for SettldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SettldError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.details.is_empty() {
            d.field("details", &self.details);
        }
        d.finish()
    }
}

impl fmt::Display for SettldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.details.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(d) = serde_json::to_string(&self.details) {
                write!(f, " {d}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SettldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`SettldError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettldErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    pub details: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&SettldError> for SettldErrorDto {
    fn from(err: &SettldError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            details: err.details.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<SettldErrorDto> for SettldError {
    fn from(dto: SettldErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            details: dto.details,
        }
    }
}
