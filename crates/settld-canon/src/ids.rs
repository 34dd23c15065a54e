// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed identifier prefixes and validation.
//!
//! Identifiers carry a typed prefix (`agt_`, `sess_`, `workord_`, …) and are
//! constrained to `^[A-Za-z0-9_-]{1,128}$`.

use uuid::Uuid;

/// Maximum identifier length in bytes.
pub const ID_MAX_LEN: usize = 128;

/// Typed prefix for generated identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    /// Agent (`agt_`).
    Agent,
    /// Session (`sess_`).
    Session,
    /// Work order (`workord_`).
    WorkOrder,
    /// Payment gate (`gate_`).
    Gate,
    /// Request-for-quote (`rfq_`).
    Rfq,
    /// Chained event (`evt_`).
    Event,
    /// Outbox entry (`obx_`).
    Outbox,
    /// Settlement receipt (`rcpt_`).
    Receipt,
}

impl IdPrefix {
    /// The prefix string without the trailing underscore.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agt",
            Self::Session => "sess",
            Self::WorkOrder => "workord",
            Self::Gate => "gate",
            Self::Rfq => "rfq",
            Self::Event => "evt",
            Self::Outbox => "obx",
            Self::Receipt => "rcpt",
        }
    }
}

/// Returns `true` if `s` matches `^[A-Za-z0-9_-]{1,128}$`.
#[must_use]
pub fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= ID_MAX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Mint a fresh identifier with the given typed prefix.
#[must_use]
pub fn new_id(prefix: IdPrefix) -> String {
    format!("{}_{}", prefix.as_str(), Uuid::new_v4().simple())
}

/// Returns `true` if `id` carries the given typed prefix.
#[must_use]
pub fn has_prefix(id: &str, prefix: IdPrefix) -> bool {
    id.strip_prefix(prefix.as_str())
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|rest| !rest.is_empty())
}

/// Returns `true` if `s` is a magic-link ingest token (`^ml_[0-9a-f]{48}$`).
#[must_use]
pub fn is_magic_link_token(s: &str) -> bool {
    s.strip_prefix("ml_").is_some_and(|hex| {
        hex.len() == 48 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    })
}

/// Derive a magic-link token from a hex digest (first 48 hex chars).
///
/// Deriving the token from content makes re-uploads of identical bytes land
/// on the same token, which is what drives ingest dedup.
#[must_use]
pub fn magic_link_token_from_digest(digest_hex: &str) -> String {
    format!("ml_{}", &digest_hex[..48])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_prefixed() {
        let id = new_id(IdPrefix::Event);
        assert!(is_valid_id(&id));
        assert!(has_prefix(&id, IdPrefix::Event));
        assert!(!has_prefix(&id, IdPrefix::Session));
    }

    #[test]
    fn id_charset_enforced() {
        assert!(is_valid_id("agt_abc-DEF_123"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id("has/slash"));
        assert!(!is_valid_id(&"a".repeat(129)));
        assert!(is_valid_id(&"a".repeat(128)));
    }

    #[test]
    fn workord_prefix_is_not_a_prefix_of_gate() {
        assert!(has_prefix("workord_1", IdPrefix::WorkOrder));
        assert!(!has_prefix("workord_", IdPrefix::WorkOrder));
        assert!(!has_prefix("workordx_1", IdPrefix::WorkOrder));
    }

    #[test]
    fn magic_link_tokens() {
        let digest = sample_digest();
        let tok = magic_link_token_from_digest(&digest);
        assert!(is_magic_link_token(&tok));
        assert!(!is_magic_link_token("ml_short"));
        assert!(!is_magic_link_token("xx_0123456789abcdef0123456789abcdef0123456789abcdef"));
        assert!(!is_magic_link_token(
            "ml_0123456789ABCDEF0123456789abcdef0123456789abcdef"
        ));
    }

    fn sample_digest() -> String {
        crate::sha256_hex(b"bundle bytes")
    }
}
