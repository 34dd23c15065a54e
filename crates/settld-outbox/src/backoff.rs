// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff with a bounded, deterministic jitter band.
//!
//! Jitter is derived from the entry id and attempt number rather than a live
//! RNG, so retry schedules are reproducible in tests while still decorrelated
//! across entries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use settld_canon::sha256_hex;

/// Retry tuning for the delivery worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// First-retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub cap_delay_ms: u64,
    /// Jitter band width in milliseconds (added on top of the backoff).
    pub jitter_band_ms: u64,
    /// Attempts before an entry is dead-lettered.
    pub max_attempts: u32,
    /// Lease duration granted to a worker per attempt, in seconds.
    pub lease_secs: u64,
    /// Per-delivery HTTP timeout in seconds.
    pub delivery_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            cap_delay_ms: 300_000,
            jitter_band_ms: 500,
            max_attempts: 10,
            lease_secs: 60,
            delivery_timeout_secs: 10,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempts + 1`:
    /// `min(cap, base * 2^(attempts-1))` plus jitter in `[0, jitter_band)`.
    #[must_use]
    pub fn delay_ms(&self, attempts: u32, entry_id: &str) -> u64 {
        let exp = attempts.saturating_sub(1).min(32);
        let backoff = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.cap_delay_ms);
        backoff + self.jitter_ms(attempts, entry_id)
    }

    /// The next attempt instant, given the current attempt count.
    #[must_use]
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts: u32, entry_id: &str) -> String {
        let at = now + Duration::milliseconds(self.delay_ms(attempts, entry_id) as i64);
        at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// Whether the entry has exhausted its attempts.
    #[must_use]
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    fn jitter_ms(&self, attempts: u32, entry_id: &str) -> u64 {
        if self.jitter_band_ms == 0 {
            return 0;
        }
        let digest = sha256_hex(format!("{entry_id}:{attempts}").as_bytes());
        // First 8 hex chars give a u32-sized sample; modulo keeps the band.
        let sample = u64::from_str_radix(&digest[..8], 16).unwrap_or(0);
        sample % self.jitter_band_ms
    }
}
