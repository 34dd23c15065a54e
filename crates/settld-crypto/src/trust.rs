// SPDX-License-Identifier: MIT OR Apache-2.0
//! Role-based trust file.
//!
//! A verifier that holds only this file and an artifact on disk can validate
//! every signature claim offline. The file enumerates named SPKI public key
//! PEMs by role; lookups are by derived key id.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{decode_public_key_pem, key_id_for_public_pem, verify_detached, CryptoError};

/// Signer roles a trust file may enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrustRole {
    /// Root governance keys.
    GovernanceRoots,
    /// Pricing attestation signers.
    PricingSigners,
    /// Time-authority signers.
    TimeAuthorities,
    /// Buyer decision signers.
    BuyerDecisionSigners,
}

impl TrustRole {
    /// All roles, in file order.
    pub const ALL: [TrustRole; 4] = [
        TrustRole::GovernanceRoots,
        TrustRole::PricingSigners,
        TrustRole::TimeAuthorities,
        TrustRole::BuyerDecisionSigners,
    ];
}

/// One named public key in the trust file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedKey {
    /// Operator-chosen key name (unique within its role).
    pub name: String,
    /// Role this key is trusted for.
    pub role: TrustRole,
    /// SPKI public key PEM.
    pub public_key_pem: String,
    /// Derived `ed25519:<hex32>` key id.
    pub key_id: String,
}

/// Errors from trust lookups and signature checks.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrustError {
    /// The signer's key id is not present in the trust file.
    #[error("SIGNER_NOT_TRUSTED: unknown signer key id {key_id}")]
    SignerNotTrusted {
        /// The unknown key id.
        key_id: String,
    },

    /// The key is trusted but not for the required role.
    #[error("SIGNER_NOT_TRUSTED: key {key_id} is not trusted for role {role:?}")]
    WrongRole {
        /// The key id.
        key_id: String,
        /// The role that was required.
        role: TrustRole,
    },

    /// The signature did not verify against the trusted key.
    #[error("signature verification failed for key {key_id}")]
    BadSignature {
        /// The key id the signature was checked against.
        key_id: String,
    },
}

// ---------------------------------------------------------------------------
// On-disk form
// ---------------------------------------------------------------------------

/// Serialized trust file: role → key name → public key PEM.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrustFile {
    /// Root governance keys.
    pub governance_roots: BTreeMap<String, String>,
    /// Pricing attestation signers.
    pub pricing_signers: BTreeMap<String, String>,
    /// Time-authority signers.
    pub time_authorities: BTreeMap<String, String>,
    /// Buyer decision signers.
    pub buyer_decision_signers: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// TrustStore
// ---------------------------------------------------------------------------

/// In-memory trust store indexed by derived key id.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    by_key_id: BTreeMap<String, TrustedKey>,
}

impl TrustStore {
    /// Create an empty trust store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a parsed [`TrustFile`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPem`] for any PEM that fails to parse;
    /// a trust file with a bad key is rejected whole.
    pub fn from_file(file: &TrustFile) -> Result<Self, CryptoError> {
        let mut store = Self::new();
        for (role, keys) in [
            (TrustRole::GovernanceRoots, &file.governance_roots),
            (TrustRole::PricingSigners, &file.pricing_signers),
            (TrustRole::TimeAuthorities, &file.time_authorities),
            (TrustRole::BuyerDecisionSigners, &file.buyer_decision_signers),
        ] {
            for (name, pem) in keys {
                store.insert_pem(role, name, pem)?;
            }
        }
        Ok(store)
    }

    /// Parse a trust file from JSON text and build the store.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPem`] with the parse detail if the JSON
    /// or any PEM is malformed.
    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let file: TrustFile = serde_json::from_str(json).map_err(|e| CryptoError::InvalidPem {
            kind: "public",
            reason: format!("trust file JSON: {e}"),
        })?;
        Self::from_file(&file)
    }

    /// Insert a named PEM under a role, validating it parses.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPem`] if the PEM is not a valid SPKI
    /// Ed25519 public key.
    pub fn insert_pem(
        &mut self,
        role: TrustRole,
        name: &str,
        pem: &str,
    ) -> Result<(), CryptoError> {
        decode_public_key_pem(pem)?;
        let key_id = key_id_for_public_pem(pem);
        self.by_key_id.insert(
            key_id.clone(),
            TrustedKey {
                name: name.to_string(),
                role,
                public_key_pem: pem.to_string(),
                key_id,
            },
        );
        Ok(())
    }

    /// Look up a trusted key by its id.
    #[must_use]
    pub fn lookup(&self, key_id: &str) -> Option<&TrustedKey> {
        self.by_key_id.get(key_id)
    }

    /// Number of keys in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key_id.len()
    }

    /// Returns `true` if the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key_id.is_empty()
    }

    /// Verify a detached signature by a named signer.
    ///
    /// # Errors
    ///
    /// - [`TrustError::SignerNotTrusted`] if the key id is unknown.
    /// - [`TrustError::BadSignature`] if the signature fails.
    pub fn verify(
        &self,
        bytes: &[u8],
        signature_b64: &str,
        key_id: &str,
    ) -> Result<&TrustedKey, TrustError> {
        let key = self
            .lookup(key_id)
            .ok_or_else(|| TrustError::SignerNotTrusted {
                key_id: key_id.to_string(),
            })?;
        let vk = decode_public_key_pem(&key.public_key_pem).map_err(|_| {
            TrustError::BadSignature {
                key_id: key_id.to_string(),
            }
        })?;
        if !verify_detached(bytes, signature_b64, &vk) {
            return Err(TrustError::BadSignature {
                key_id: key_id.to_string(),
            });
        }
        Ok(key)
    }

    /// Verify a detached signature and require the signer to hold `role`.
    ///
    /// # Errors
    ///
    /// As [`TrustStore::verify`], plus [`TrustError::WrongRole`].
    pub fn verify_role(
        &self,
        bytes: &[u8],
        signature_b64: &str,
        key_id: &str,
        role: TrustRole,
    ) -> Result<&TrustedKey, TrustError> {
        let key = self.verify(bytes, signature_b64, key_id)?;
        if key.role != role {
            return Err(TrustError::WrongRole {
                key_id: key_id.to_string(),
                role,
            });
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;

    fn store_with(role: TrustRole, kp: &Keypair) -> TrustStore {
        let mut store = TrustStore::new();
        store.insert_pem(role, "test-key", kp.public_key_pem()).unwrap();
        store
    }

    #[test]
    fn verify_known_signer() {
        let kp = Keypair::generate().unwrap();
        let store = store_with(TrustRole::GovernanceRoots, &kp);
        let sig = kp.sign(b"payload");
        let key = store.verify(b"payload", &sig, kp.key_id()).unwrap();
        assert_eq!(key.name, "test-key");
    }

    #[test]
    fn unknown_signer_is_not_trusted() {
        let kp = Keypair::generate().unwrap();
        let store = TrustStore::new();
        let sig = kp.sign(b"payload");
        let err = store.verify(b"payload", &sig, kp.key_id()).unwrap_err();
        assert!(matches!(err, TrustError::SignerNotTrusted { .. }));
        assert!(err.to_string().starts_with("SIGNER_NOT_TRUSTED"));
    }

    #[test]
    fn wrong_role_is_rejected() {
        let kp = Keypair::generate().unwrap();
        let store = store_with(TrustRole::PricingSigners, &kp);
        let sig = kp.sign(b"payload");
        let err = store
            .verify_role(b"payload", &sig, kp.key_id(), TrustRole::TimeAuthorities)
            .unwrap_err();
        assert!(matches!(err, TrustError::WrongRole { .. }));
    }

    #[test]
    fn trust_file_json_roundtrip() {
        let kp = Keypair::generate().unwrap();
        let mut file = TrustFile::default();
        file.governance_roots
            .insert("root-1".into(), kp.public_key_pem().to_string());
        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains("governanceRoots"));
        let store = TrustStore::from_json(&json).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.lookup(kp.key_id()).is_some());
    }

    #[test]
    fn bad_pem_rejects_whole_file() {
        let mut file = TrustFile::default();
        file.pricing_signers.insert("bad".into(), "not a pem".into());
        assert!(TrustStore::from_file(&file).is_err());
    }
}
