// SPDX-License-Identifier: MIT OR Apache-2.0
//! Settld — a multi-tenant, verifiable settlement and agent-substrate
//! service.
//!
//! This facade re-exports the workspace crates so integration code can take
//! one dependency. The substrate is hash-first: canonical JSON (C1) feeds
//! per-event chain hashes (C3), which feed artifact seals (C5), which feed
//! deterministic bundle bytes (C6). A verifier holding only a trust file and
//! an artifact on disk can rebuild and validate every claim offline.
#![deny(unsafe_code)]

pub use settld_artifact as artifact;
pub use settld_bundle as bundle;
pub use settld_canon as canon;
pub use settld_chain as chain;
pub use settld_conformance as conformance;
pub use settld_crypto as crypto;
pub use settld_error as error;
pub use settld_gate as gate;
pub use settld_outbox as outbox;
pub use settld_session as session;
pub use settld_store as store;
pub use settld_workorder as workorder;
