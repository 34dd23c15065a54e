// SPDX-License-Identifier: MIT OR Apache-2.0
//! SQLite store driver.
//!
//! Implements the same contract as the memory driver with every
//! read-check-write sequence inside a single `IMMEDIATE` transaction, which
//! takes the database write lock up front and serializes appends and leases
//! across connections.

use chrono::Duration;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

use settld_chain::{ChainedEvent, StreamSnapshot};

use crate::checks::{advance_snapshot, validate_append};
use crate::{
    AppendOutcome, ArtifactFilter, ArtifactRecord, AuthKeyRecord, Clock, IdempotencyRecord,
    OpsAuditRecord, OutboxAck, OutboxEntry, OutboxState, Store, StoreError, SystemClock,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
  tenant_id   TEXT NOT NULL,
  stream_id   TEXT NOT NULL,
  seq         INTEGER NOT NULL,
  event_id    TEXT NOT NULL,
  body        TEXT NOT NULL,
  PRIMARY KEY (tenant_id, stream_id, seq)
);
CREATE UNIQUE INDEX IF NOT EXISTS events_by_id
  ON events (tenant_id, stream_id, event_id);

CREATE TABLE IF NOT EXISTS snapshots (
  tenant_id       TEXT NOT NULL,
  stream_id       TEXT NOT NULL,
  last_chain_hash TEXT,
  last_event_id   TEXT,
  event_count     INTEGER NOT NULL,
  PRIMARY KEY (tenant_id, stream_id)
);

CREATE TABLE IF NOT EXISTS artifacts (
  tenant_id  TEXT NOT NULL,
  kind       TEXT NOT NULL,
  id         TEXT NOT NULL,
  created_at TEXT NOT NULL,
  body       TEXT NOT NULL,
  PRIMARY KEY (tenant_id, kind, id)
);

CREATE TABLE IF NOT EXISTS auth_keys (
  tenant_id      TEXT NOT NULL,
  key_id         TEXT NOT NULL,
  public_key_pem TEXT NOT NULL,
  status         TEXT NOT NULL,
  agent_id       TEXT,
  PRIMARY KEY (tenant_id, key_id)
);

CREATE TABLE IF NOT EXISTS idempotency (
  tenant_id  TEXT NOT NULL,
  key        TEXT NOT NULL,
  outcome    TEXT NOT NULL,
  stored_at  TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  PRIMARY KEY (tenant_id, key)
);

CREATE TABLE IF NOT EXISTS outbox (
  tenant_id       TEXT NOT NULL,
  id              TEXT NOT NULL,
  artifact_kind   TEXT NOT NULL,
  artifact_id     TEXT NOT NULL,
  destination_id  TEXT NOT NULL,
  created_at      TEXT NOT NULL,
  attempts        INTEGER NOT NULL,
  next_attempt_at TEXT NOT NULL,
  state           TEXT NOT NULL,
  idempotency_key TEXT NOT NULL,
  last_error      TEXT,
  lease_deadline  TEXT,
  PRIMARY KEY (tenant_id, id)
);

CREATE TABLE IF NOT EXISTS ops_audit (
  tenant_id TEXT NOT NULL,
  seq       INTEGER PRIMARY KEY AUTOINCREMENT,
  body      TEXT NOT NULL
);
";

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] if the file cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path).map_err(sql_err)?)
    }

    /// Open an in-memory database (tests).
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] on driver failure.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    /// Replace the clock (tests).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection mutex poisoned")
    }
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::Storage {
        reason: e.to_string(),
    }
}

fn json_err(e: serde_json::Error) -> StoreError {
    StoreError::Storage {
        reason: e.to_string(),
    }
}

fn state_str(state: OutboxState) -> &'static str {
    match state {
        OutboxState::Pending => "pending",
        OutboxState::Leased => "leased",
        OutboxState::Delivered => "delivered",
        OutboxState::Failed => "failed",
        OutboxState::Dlq => "dlq",
    }
}

fn parse_state(s: &str) -> OutboxState {
    match s {
        "leased" => OutboxState::Leased,
        "delivered" => OutboxState::Delivered,
        "failed" => OutboxState::Failed,
        "dlq" => OutboxState::Dlq,
        _ => OutboxState::Pending,
    }
}

fn row_to_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    Ok(OutboxEntry {
        tenant_id: row.get(0)?,
        id: row.get(1)?,
        artifact_kind: row.get(2)?,
        artifact_id: row.get(3)?,
        destination_id: row.get(4)?,
        created_at: row.get(5)?,
        attempts: row.get(6)?,
        next_attempt_at: row.get(7)?,
        state: parse_state(&row.get::<_, String>(8)?),
        idempotency_key: row.get(9)?,
        last_error: row.get(10)?,
        lease_deadline: row.get(11)?,
    })
}

const OUTBOX_COLS: &str = "tenant_id, id, artifact_kind, artifact_id, destination_id, \
     created_at, attempts, next_attempt_at, state, idempotency_key, last_error, lease_deadline";

impl Store for SqliteStore {
    fn now_iso(&self) -> String {
        self.clock.now_iso()
    }

    fn append_event(
        &self,
        tenant_id: &str,
        event: &ChainedEvent,
        expected_prev: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        // Idempotent replay.
        if let Some(key) = idempotency_key {
            let idem_key = format!("append:{}:{key}", event.stream_id);
            let prior_id: Option<String> = tx
                .query_row(
                    "SELECT outcome FROM idempotency WHERE tenant_id = ?1 AND key = ?2",
                    params![tenant_id, idem_key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?
                .and_then(|outcome: String| {
                    serde_json::from_str::<Value>(&outcome)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                });
            if let Some(prior_id) = prior_id {
                let body: Option<String> = tx
                    .query_row(
                        "SELECT body FROM events
                         WHERE tenant_id = ?1 AND stream_id = ?2 AND event_id = ?3",
                        params![tenant_id, event.stream_id, prior_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(sql_err)?;
                if let Some(body) = body {
                    let prior: ChainedEvent =
                        serde_json::from_str(&body).map_err(json_err)?;
                    let snapshot =
                        read_snapshot(&tx, tenant_id, &event.stream_id)?.unwrap_or_else(|| {
                            StreamSnapshot::empty(&event.stream_id)
                        });
                    tx.commit().map_err(sql_err)?;
                    return Ok(AppendOutcome {
                        event: prior,
                        stream_snapshot: snapshot,
                        deduped: true,
                    });
                }
            }
        }

        let head = read_snapshot(&tx, tenant_id, &event.stream_id)?
            .unwrap_or_else(|| StreamSnapshot::empty(&event.stream_id));

        let auth_key = match event.signer_key_id.as_deref() {
            Some(key_id) => read_auth_key(&tx, tenant_id, key_id)?,
            None => None,
        };
        validate_append(event, &head, expected_prev, auth_key.as_ref())?;

        let snapshot = advance_snapshot(&head, event);
        let body = serde_json::to_string(event).map_err(json_err)?;
        tx.execute(
            "INSERT INTO events (tenant_id, stream_id, seq, event_id, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tenant_id, event.stream_id, head.event_count as i64, event.id, body],
        )
        .map_err(sql_err)?;
        tx.execute(
            "INSERT INTO snapshots (tenant_id, stream_id, last_chain_hash, last_event_id, event_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (tenant_id, stream_id) DO UPDATE SET
               last_chain_hash = excluded.last_chain_hash,
               last_event_id = excluded.last_event_id,
               event_count = excluded.event_count",
            params![
                tenant_id,
                snapshot.stream_id,
                snapshot.last_chain_hash,
                snapshot.last_event_id,
                snapshot.event_count as i64
            ],
        )
        .map_err(sql_err)?;

        if let Some(key) = idempotency_key {
            let now = self.clock.now();
            tx.execute(
                "INSERT OR REPLACE INTO idempotency (tenant_id, key, outcome, stored_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    format!("append:{}:{key}", event.stream_id),
                    serde_json::to_string(&Value::String(event.id.clone())).map_err(json_err)?,
                    self.clock.now_iso(),
                    iso(now + Duration::hours(24)),
                ],
            )
            .map_err(sql_err)?;
        }

        tx.commit().map_err(sql_err)?;
        Ok(AppendOutcome {
            event: event.clone(),
            stream_snapshot: snapshot,
            deduped: false,
        })
    }

    fn list_events(
        &self,
        tenant_id: &str,
        stream_id: &str,
        since_event_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<ChainedEvent>, StoreError> {
        let conn = self.lock();
        let since_seq: i64 = match since_event_id {
            Some(id) => {
                let seq: Option<i64> = conn
                    .query_row(
                        "SELECT seq FROM events
                         WHERE tenant_id = ?1 AND stream_id = ?2 AND event_id = ?3",
                        params![tenant_id, stream_id, id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(sql_err)?;
                match seq {
                    Some(seq) => seq,
                    None => return Ok(vec![]),
                }
            }
            None => -1,
        };
        let mut stmt = conn
            .prepare(
                "SELECT body FROM events
                 WHERE tenant_id = ?1 AND stream_id = ?2 AND seq > ?3
                 ORDER BY seq ASC LIMIT ?4",
            )
            .map_err(sql_err)?;
        let limit = limit.map_or(i64::MAX, |l| l as i64);
        let rows = stmt
            .query_map(params![tenant_id, stream_id, since_seq, limit], |row| {
                row.get::<_, String>(0)
            })
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for body in rows {
            let body = body.map_err(sql_err)?;
            out.push(serde_json::from_str(&body).map_err(json_err)?);
        }
        Ok(out)
    }

    fn get_stream_snapshot(
        &self,
        tenant_id: &str,
        stream_id: &str,
    ) -> Result<Option<StreamSnapshot>, StoreError> {
        let conn = self.lock();
        read_snapshot(&conn, tenant_id, stream_id)
    }

    fn put_artifact(&self, tenant_id: &str, record: &ArtifactRecord) -> Result<(), StoreError> {
        let conn = self.lock();
        let body = serde_json::to_string(&record.body).map_err(json_err)?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO artifacts (tenant_id, kind, id, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![tenant_id, record.kind, record.id, record.created_at, body],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::Duplicate {
                what: "artifact",
                id: record.id.clone(),
            });
        }
        Ok(())
    }

    fn get_artifact(
        &self,
        tenant_id: &str,
        kind: &str,
        id: &str,
    ) -> Result<Option<ArtifactRecord>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT created_at, body FROM artifacts
             WHERE tenant_id = ?1 AND kind = ?2 AND id = ?3",
            params![tenant_id, kind, id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            },
        )
        .optional()
        .map_err(sql_err)?
        .map(|(created_at, body)| {
            Ok(ArtifactRecord {
                kind: kind.to_string(),
                id: id.to_string(),
                created_at,
                body: serde_json::from_str(&body).map_err(json_err)?,
            })
        })
        .transpose()
    }

    fn list_artifacts(
        &self,
        tenant_id: &str,
        filter: &ArtifactFilter,
    ) -> Result<Vec<ArtifactRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT kind, id, created_at, body FROM artifacts
                 WHERE tenant_id = ?1
                   AND (?2 IS NULL OR kind = ?2)
                   AND (?3 IS NULL OR created_at >= ?3)
                 ORDER BY created_at DESC LIMIT ?4",
            )
            .map_err(sql_err)?;
        let limit = filter.limit.map_or(i64::MAX, |l| l as i64);
        let rows = stmt
            .query_map(
                params![tenant_id, filter.kind, filter.since, limit],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (kind, id, created_at, body) = row.map_err(sql_err)?;
            out.push(ArtifactRecord {
                kind,
                id,
                created_at,
                body: serde_json::from_str(&body).map_err(json_err)?,
            });
        }
        Ok(out)
    }

    fn put_auth_key(&self, tenant_id: &str, record: &AuthKeyRecord) -> Result<(), StoreError> {
        let conn = self.lock();
        let status = serde_json::to_string(&record.status).map_err(json_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO auth_keys (tenant_id, key_id, public_key_pem, status, agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant_id,
                record.key_id,
                record.public_key_pem,
                status.trim_matches('"'),
                record.agent_id
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn lookup_auth_key(
        &self,
        tenant_id: &str,
        key_id: &str,
    ) -> Result<Option<AuthKeyRecord>, StoreError> {
        let conn = self.lock();
        read_auth_key(&conn, tenant_id, key_id)
    }

    fn put_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
        outcome: &Value,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        let now = self.clock.now();
        conn.execute(
            "INSERT OR REPLACE INTO idempotency (tenant_id, key, outcome, stored_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant_id,
                key,
                serde_json::to_string(outcome).map_err(json_err)?,
                iso(now),
                iso(now + Duration::seconds(ttl_secs as i64)),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn get_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let conn = self.lock();
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT outcome, stored_at, expires_at FROM idempotency
                 WHERE tenant_id = ?1 AND key = ?2",
                params![tenant_id, key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(sql_err)?;
        let Some((outcome, stored_at, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at <= self.clock.now_iso() {
            return Ok(None);
        }
        Ok(Some(IdempotencyRecord {
            key: key.to_string(),
            outcome: serde_json::from_str(&outcome).map_err(json_err)?,
            stored_at,
            expires_at,
        }))
    }

    fn enqueue_outbox(&self, tenant_id: &str, entry: &OutboxEntry) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO outbox ({OUTBOX_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    tenant_id,
                    entry.id,
                    entry.artifact_kind,
                    entry.artifact_id,
                    entry.destination_id,
                    entry.created_at,
                    entry.attempts,
                    entry.next_attempt_at,
                    state_str(entry.state),
                    entry.idempotency_key,
                    entry.last_error,
                    entry.lease_deadline
                ],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::Duplicate {
                what: "outbox entry",
                id: entry.id.clone(),
            });
        }
        Ok(())
    }

    fn lease_outbox(
        &self,
        tenant_id: &str,
        n: usize,
        now: &str,
        lease_deadline: &str,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;
        let ids: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM outbox
                     WHERE tenant_id = ?1
                       AND ((state = 'pending' AND next_attempt_at <= ?2)
                         OR (state = 'leased' AND lease_deadline IS NOT NULL
                             AND lease_deadline <= ?2))
                     ORDER BY next_attempt_at ASC LIMIT ?3",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![tenant_id, now, n as i64], |row| row.get(0))
                .map_err(sql_err)?;
            rows.collect::<Result<_, _>>().map_err(sql_err)?
        };
        let mut leased = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE outbox SET state = 'leased', lease_deadline = ?3, attempts = attempts + 1
                 WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, id, lease_deadline],
            )
            .map_err(sql_err)?;
            let entry = tx
                .query_row(
                    &format!("SELECT {OUTBOX_COLS} FROM outbox WHERE tenant_id = ?1 AND id = ?2"),
                    params![tenant_id, id],
                    row_to_outbox,
                )
                .map_err(sql_err)?;
            leased.push(entry);
        }
        tx.commit().map_err(sql_err)?;
        Ok(leased)
    }

    fn ack_outbox(
        &self,
        tenant_id: &str,
        entry_id: &str,
        ack: &OutboxAck,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = match ack {
            OutboxAck::Delivered => conn.execute(
                "UPDATE outbox SET state = 'delivered', last_error = NULL, lease_deadline = NULL
                 WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, entry_id],
            ),
            OutboxAck::Retry {
                error,
                next_attempt_at,
            } => conn.execute(
                "UPDATE outbox SET state = 'pending', last_error = ?3, next_attempt_at = ?4,
                       lease_deadline = NULL
                 WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, entry_id, error, next_attempt_at],
            ),
            OutboxAck::Dlq { error } => conn.execute(
                "UPDATE outbox SET state = 'dlq', last_error = ?3, lease_deadline = NULL
                 WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, entry_id, error],
            ),
        }
        .map_err(sql_err)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                what: "outbox entry",
                id: entry_id.to_string(),
            });
        }
        Ok(())
    }

    fn get_outbox(
        &self,
        tenant_id: &str,
        entry_id: &str,
    ) -> Result<Option<OutboxEntry>, StoreError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {OUTBOX_COLS} FROM outbox WHERE tenant_id = ?1 AND id = ?2"),
            params![tenant_id, entry_id],
            row_to_outbox,
        )
        .optional()
        .map_err(sql_err)
    }

    fn put_ops_audit(&self, tenant_id: &str, record: &OpsAuditRecord) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ops_audit (tenant_id, body) VALUES (?1, ?2)",
            params![tenant_id, serde_json::to_string(record).map_err(json_err)?],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn list_ops_audit(&self, tenant_id: &str) -> Result<Vec<OpsAuditRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT body FROM ops_audit WHERE tenant_id = ?1 ORDER BY seq ASC")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![tenant_id], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body.map_err(sql_err)?).map_err(json_err)?);
        }
        Ok(out)
    }
}

fn read_snapshot(
    conn: &Connection,
    tenant_id: &str,
    stream_id: &str,
) -> Result<Option<StreamSnapshot>, StoreError> {
    conn.query_row(
        "SELECT last_chain_hash, last_event_id, event_count FROM snapshots
         WHERE tenant_id = ?1 AND stream_id = ?2",
        params![tenant_id, stream_id],
        |row| {
            Ok(StreamSnapshot {
                stream_id: stream_id.to_string(),
                last_chain_hash: row.get(0)?,
                last_event_id: row.get(1)?,
                event_count: row.get::<_, i64>(2)? as u64,
            })
        },
    )
    .optional()
    .map_err(sql_err)
}

fn read_auth_key(
    conn: &Connection,
    tenant_id: &str,
    key_id: &str,
) -> Result<Option<AuthKeyRecord>, StoreError> {
    conn.query_row(
        "SELECT public_key_pem, status, agent_id FROM auth_keys
         WHERE tenant_id = ?1 AND key_id = ?2",
        params![tenant_id, key_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        },
    )
    .optional()
    .map_err(sql_err)?
    .map(|(public_key_pem, status, agent_id)| {
        let status = serde_json::from_str(&format!("\"{status}\"")).map_err(json_err)?;
        Ok(AuthKeyRecord {
            key_id: key_id.to_string(),
            public_key_pem,
            status,
            agent_id,
        })
    })
    .transpose()
}

fn iso(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
