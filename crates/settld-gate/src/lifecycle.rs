// SPDX-License-Identifier: MIT OR Apache-2.0
//! Participant lifecycle and signer-key gates.
//!
//! Every route that operates on a participant checks these first: suspended
//! agents map to HTTP 410, throttled agents to 429, and any signed operation
//! by a non-active key fails with `X402_AGENT_SIGNER_KEY_INVALID`.

use serde::{Deserialize, Serialize};
use settld_error::{ErrorCode, SettldError};

/// Lifecycle of an agent participating in gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycle {
    /// Fully operational.
    Active,
    /// Suspended; every gate route returns 410.
    Suspended,
    /// Throttled; every gate route returns 429.
    Throttled,
}

/// Lifecycle status of an agent's signer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerKeyStatus {
    /// Key may sign.
    Active,
    /// Rotated out; signatures no longer accepted.
    Rotated,
    /// Revoked; signatures no longer accepted.
    Revoked,
}

/// Reject operations for suspended or throttled participants.
///
/// # Errors
///
/// `X402_AGENT_SUSPENDED` (410) or `X402_AGENT_THROTTLED` (429).
pub fn ensure_participant_active(
    agent_id: &str,
    lifecycle: AgentLifecycle,
) -> Result<(), SettldError> {
    match lifecycle {
        AgentLifecycle::Active => Ok(()),
        AgentLifecycle::Suspended => Err(SettldError::new(
            ErrorCode::X402AgentSuspended,
            "agent is suspended",
        )
        .with_detail("agentId", agent_id)),
        AgentLifecycle::Throttled => Err(SettldError::new(
            ErrorCode::X402AgentThrottled,
            "agent is throttled",
        )
        .with_detail("agentId", agent_id)),
    }
}

/// Reject signed operations by rotated or revoked keys.
///
/// # Errors
///
/// `X402_AGENT_SIGNER_KEY_INVALID`.
pub fn ensure_signer_key_active(key_id: &str, status: SignerKeyStatus) -> Result<(), SettldError> {
    if status == SignerKeyStatus::Active {
        return Ok(());
    }
    Err(SettldError::new(
        ErrorCode::X402AgentSignerKeyInvalid,
        "signer key is not active",
    )
    .with_detail("signerKeyId", key_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_agent_passes() {
        assert!(ensure_participant_active("agt_a", AgentLifecycle::Active).is_ok());
    }

    #[test]
    fn suspended_maps_to_410() {
        let err = ensure_participant_active("agt_a", AgentLifecycle::Suspended).unwrap_err();
        assert_eq!(err.code, ErrorCode::X402AgentSuspended);
        assert_eq!(err.code.http_status(), 410);
    }

    #[test]
    fn throttled_maps_to_429() {
        let err = ensure_participant_active("agt_a", AgentLifecycle::Throttled).unwrap_err();
        assert_eq!(err.code.http_status(), 429);
    }

    #[test]
    fn rotated_and_revoked_keys_are_invalid() {
        for status in [SignerKeyStatus::Rotated, SignerKeyStatus::Revoked] {
            let err = ensure_signer_key_active("ed25519:abc", status).unwrap_err();
            assert_eq!(err.code, ErrorCode::X402AgentSignerKeyInvalid);
        }
        assert!(ensure_signer_key_active("ed25519:abc", SignerKeyStatus::Active).is_ok());
    }
}
