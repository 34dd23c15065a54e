// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and trust-key snapshots.
//!
//! Settings come from a TOML file overlaid by environment variables. The
//! canonical env prefix is `SETTLD_*`; legacy `NOOTERRA_*` names are read as
//! aliases during the transition window (canonical wins when both are set).
//! The loaded snapshot is immutable and swapped atomically — in-flight
//! requests keep the snapshot they started with.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use settld_crypto::trust::TrustFile;
use settld_crypto::{CryptoError, TrustStore};

/// Trust env var names, in role order. Both prefixes are accepted.
pub const TRUST_ENV_VARS: [(&str, &str); 4] = [
    ("TRUSTED_GOVERNANCE_ROOT_KEYS_JSON", "governanceRoots"),
    ("TRUSTED_PRICING_SIGNER_KEYS_JSON", "pricingSigners"),
    ("TRUSTED_TIME_AUTHORITY_KEYS_JSON", "timeAuthorities"),
    ("TRUSTED_BUYER_KEYS_JSON", "buyerDecisionSigners"),
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },

    /// A trust env var held malformed JSON or a bad PEM.
    #[error("trust keys invalid in {var}: {reason}")]
    TrustInvalid {
        /// The offending env var.
        var: String,
        /// Parse detail.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Which store driver to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreDriver {
    /// Mutex-guarded in-process maps.
    #[default]
    Memory,
    /// SQLite file.
    Sqlite,
}

/// Store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreSettings {
    /// Driver selection.
    pub driver: StoreDriver,
    /// Database path for the SQLite driver.
    pub path: Option<String>,
}

/// HTTP settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Bind address.
    pub bind: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Delivery worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// First-retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub cap_delay_ms: u64,
    /// Jitter band width in milliseconds.
    pub jitter_band_ms: u64,
    /// Attempts before dead-lettering.
    pub max_attempts: u32,
    /// Lease duration per attempt, seconds.
    pub lease_secs: u64,
    /// Per-delivery HTTP timeout, seconds.
    pub delivery_timeout_secs: u64,
    /// Entries leased per pass.
    pub batch: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            cap_delay_ms: 300_000,
            jitter_band_ms: 500,
            max_attempts: 10,
            lease_secs: 60,
            delivery_timeout_secs: 10,
            batch: 16,
        }
    }
}

/// One webhook destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationSettings {
    /// Webhook URL.
    pub url: String,
    /// Shared HMAC secret.
    pub secret: String,
}

/// Ingest settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Accepted bearer keys; empty means ingest is open.
    pub keys: Vec<String>,
    /// Maximum accepted upload size in bytes.
    pub max_zip_bytes: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            keys: vec![],
            max_zip_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SettldConfig {
    /// Log level override (`"debug"`, `"info"`, `"warn"`).
    pub log_level: Option<String>,
    /// Tenants the background workers service.
    pub tenants: Vec<String>,
    /// Store settings.
    pub store: StoreSettings,
    /// HTTP settings.
    pub http: HttpSettings,
    /// Worker settings.
    pub worker: WorkerSettings,
    /// Ingest settings.
    pub ingest: IngestSettings,
    /// Named delivery destinations.
    pub destinations: BTreeMap<String, DestinationSettings>,
}

impl SettldConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay env vars onto this config. `lookup` is injectable for tests;
    /// pass `|k| std::env::var(k).ok()` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| env_alias(&lookup, name);
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = Some(v);
        }
        if let Some(v) = get("HTTP_BIND") {
            self.http.bind = v;
        }
        if let Some(v) = get("STORE_DRIVER") {
            self.store.driver = match v.as_str() {
                "sqlite" => StoreDriver::Sqlite,
                _ => StoreDriver::Memory,
            };
        }
        if let Some(v) = get("STORE_PATH") {
            self.store.path = Some(v);
        }
        if let Some(v) = get("WORKER_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.worker.max_attempts = v;
        }
        if let Some(v) = get("WORKER_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.worker.base_delay_ms = v;
        }
        if let Some(v) = get("WORKER_BATCH").and_then(|v| v.parse().ok()) {
            self.worker.batch = v;
        }
        if let Some(v) = get("INGEST_KEYS") {
            self.ingest.keys = v.split(',').map(str::to_string).collect();
        }
    }

    /// Semantic validation.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = vec![];
        if self.worker.max_attempts == 0 {
            reasons.push("worker.max_attempts must be at least 1".to_string());
        }
        if self.worker.batch == 0 {
            reasons.push("worker.batch must be at least 1".to_string());
        }
        if self.store.driver == StoreDriver::Sqlite && self.store.path.is_none() {
            reasons.push("store.path is required for the sqlite driver".to_string());
        }
        for (name, dest) in &self.destinations {
            if dest.secret.is_empty() {
                reasons.push(format!("destination {name:?} has an empty secret"));
            }
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }
}

/// Canonical `SETTLD_*` name first, then the legacy `NOOTERRA_*` alias.
fn env_alias(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(&format!("SETTLD_{name}")).or_else(|| lookup(&format!("NOOTERRA_{name}")))
}

// ---------------------------------------------------------------------------
// Trust loading
// ---------------------------------------------------------------------------

/// Load the trust store from the four role env vars.
///
/// Each var holds a JSON map of key name to SPKI public key PEM. Both env
/// prefixes are accepted; an unset var contributes no keys for its role.
///
/// # Errors
///
/// [`ConfigError::TrustInvalid`] for malformed JSON or PEMs.
pub fn load_trust_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<TrustStore, ConfigError> {
    let mut file = TrustFile::default();
    for (var, _role) in TRUST_ENV_VARS {
        let Some(raw) = env_alias(&lookup, var) else {
            continue;
        };
        let keys: BTreeMap<String, String> =
            serde_json::from_str(&raw).map_err(|e| ConfigError::TrustInvalid {
                var: var.to_string(),
                reason: e.to_string(),
            })?;
        let target = match var {
            "TRUSTED_GOVERNANCE_ROOT_KEYS_JSON" => &mut file.governance_roots,
            "TRUSTED_PRICING_SIGNER_KEYS_JSON" => &mut file.pricing_signers,
            "TRUSTED_TIME_AUTHORITY_KEYS_JSON" => &mut file.time_authorities,
            _ => &mut file.buyer_decision_signers,
        };
        target.extend(keys);
    }
    TrustStore::from_file(&file).map_err(|e: CryptoError| ConfigError::TrustInvalid {
        var: "trust".to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Atomic snapshot handle
// ---------------------------------------------------------------------------

/// Atomically swappable config snapshot.
///
/// Readers call [`ConfigHandle::load`] and keep the returned `Arc` for the
/// duration of their request; a reload swaps the snapshot without touching
/// in-flight readers.
pub struct ConfigHandle {
    inner: ArcSwap<SettldConfig>,
}

impl ConfigHandle {
    /// Wrap an initial snapshot.
    #[must_use]
    pub fn new(config: SettldConfig) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<SettldConfig> {
        self.inner.load_full()
    }

    /// Atomically replace the snapshot.
    pub fn swap(&self, config: SettldConfig) {
        self.inner.store(Arc::new(config));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SettldConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settld.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"

[store]
driver = "sqlite"
path = "/tmp/settld.db"

[worker]
max_attempts = 5

[destinations.hook]
url = "https://example.test/hook"
secret = "shhh"
"#,
        )
        .unwrap();
        let config = SettldConfig::load(&path).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.store.driver, StoreDriver::Sqlite);
        assert_eq!(config.worker.max_attempts, 5);
        assert_eq!(config.destinations["hook"].secret, "shhh");
    }

    #[test]
    fn canonical_env_wins_over_alias() {
        let mut config = SettldConfig::default();
        config.apply_env(|key| match key {
            "SETTLD_LOG_LEVEL" => Some("warn".to_string()),
            "NOOTERRA_LOG_LEVEL" => Some("debug".to_string()),
            _ => None,
        });
        assert_eq!(config.log_level.as_deref(), Some("warn"));
    }

    #[test]
    fn legacy_alias_is_accepted() {
        let mut config = SettldConfig::default();
        config.apply_env(|key| match key {
            "NOOTERRA_WORKER_MAX_ATTEMPTS" => Some("4".to_string()),
            _ => None,
        });
        assert_eq!(config.worker.max_attempts, 4);
    }

    #[test]
    fn sqlite_without_path_fails_validation() {
        let config = SettldConfig {
            store: StoreSettings {
                driver: StoreDriver::Sqlite,
                path: None,
            },
            ..SettldConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn trust_env_loads_all_roles() {
        let kp = settld_crypto::Keypair::generate().unwrap();
        let keys = serde_json::json!({"root-1": kp.public_key_pem()}).to_string();
        let trust = load_trust_from_env(|key| match key {
            "SETTLD_TRUSTED_GOVERNANCE_ROOT_KEYS_JSON" => Some(keys.clone()),
            _ => None,
        })
        .unwrap();
        assert_eq!(trust.len(), 1);
        assert!(trust.lookup(kp.key_id()).is_some());
    }

    #[test]
    fn malformed_trust_json_is_rejected() {
        let err = load_trust_from_env(|key| match key {
            "SETTLD_TRUSTED_BUYER_KEYS_JSON" => Some("not json".to_string()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::TrustInvalid { .. }));
    }

    #[test]
    fn handle_swaps_atomically() {
        let handle = ConfigHandle::new(SettldConfig::default());
        let before = handle.load();
        handle.swap(SettldConfig {
            log_level: Some("trace".to_string()),
            ..SettldConfig::default()
        });
        // The old snapshot is unchanged; new readers see the new one.
        assert!(before.log_level.is_none());
        assert_eq!(handle.load().log_level.as_deref(), Some("trace"));
    }
}
