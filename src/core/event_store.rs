//! Append-only event store backed by SQLite.
//!
//! Appends go through a single writer connection inside a transaction, so
//! ids form one gap-free total order. The database runs in WAL mode with
//! `synchronous=FULL`; once `append` returns the event survives a crash.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::clock::{Clock, SystemClock};
use crate::domain::{Event, NewEvent};
use crate::error::{HubError, HubResult};

/// Default and maximum page sizes for `query`
pub const DEFAULT_QUERY_LIMIT: usize = 100;
pub const MAX_QUERY_LIMIT: usize = 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY,
    type TEXT NOT NULL,
    source TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    hops INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT,
    dedupe_key TEXT UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
CREATE INDEX IF NOT EXISTS idx_events_source ON events(source);
CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);

CREATE TABLE IF NOT EXISTS consumer_offsets (
    consumer TEXT PRIMARY KEY,
    last_event_id INTEGER NOT NULL
);
";

const EVENT_COLUMNS: &str = "id, type, source, payload, created_at, hops, idempotency_key";

/// Filters for `GET /events`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    pub type_prefix: Option<String>,
    pub source: Option<String>,
    /// Only events created at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Cursor: only events with an id strictly below this one
    pub before: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Result of an append
#[derive(Debug, Clone)]
pub struct Appended {
    pub event: Event,
    /// False when an idempotency key matched an existing event
    pub created: bool,
}

/// SQLite-backed event log
pub struct EventStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl EventStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> HubResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn, clock)
    }

    /// Volatile store for tests and dry runs
    pub fn open_in_memory() -> HubResult<Self> {
        Self::init(Connection::open_in_memory()?, Arc::new(SystemClock))
    }

    /// Volatile store with an explicit clock
    pub fn open_in_memory_with_clock(clock: Arc<dyn Clock>) -> HubResult<Self> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> HubResult<Self> {
        configure_connection(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate and durably append an event.
    ///
    /// `created_at` never goes backwards relative to the previous event, so
    /// id order and timestamp order agree even if the clock steps back.
    pub fn append(&self, new: NewEvent) -> HubResult<Appended> {
        let mut new = new;
        new.validate()?;

        let dedupe = new
            .idempotency_key
            .as_deref()
            .map(|key| dedupe_key(&new.source, key));
        let payload = serde_json::to_string(&new.payload)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;

        if let Some(key) = &dedupe {
            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM events WHERE dedupe_key = ?1", EVENT_COLUMNS),
                    params![key],
                    row_to_event,
                )
                .optional()?;
            if let Some(event) = existing {
                debug!(event_id = event.id, "Duplicate idempotency key, returning existing event");
                return Ok(Appended {
                    event,
                    created: false,
                });
            }
        }

        let last: Option<String> = tx
            .query_row(
                "SELECT created_at FROM events ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let mut created_at = self.clock.now().trunc_subsecs(6);
        if let Some(last) = last.as_deref().and_then(|s| parse_ts(s).ok()) {
            if created_at < last {
                created_at = last;
            }
        }

        tx.execute(
            "INSERT INTO events (type, source, payload, created_at, hops, idempotency_key, dedupe_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.event_type,
                new.source,
                payload,
                fmt_ts(created_at),
                new.hops,
                new.idempotency_key,
                dedupe
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Appended {
            event: Event {
                id,
                event_type: new.event_type,
                source: new.source,
                payload: new.payload,
                created_at,
                hops: new.hops,
                idempotency_key: new.idempotency_key,
            },
            created: true,
        })
    }

    /// Filtered history, newest first
    pub fn query(&self, query: &EventQuery) -> HubResult<Vec<Event>> {
        let mut sql = format!("SELECT {} FROM events WHERE 1 = 1", EVENT_COLUMNS);
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(prefix) = query.type_prefix.as_deref().filter(|p| !p.is_empty()) {
            args.push(SqlValue::Text(prefix.to_string()));
            let n = args.len();
            sql.push_str(&format!(" AND substr(type, 1, length(?{n})) = ?{n}"));
        }
        if let Some(source) = query.source.as_deref().filter(|s| !s.is_empty()) {
            args.push(SqlValue::Text(source.to_string()));
            sql.push_str(&format!(" AND source = ?{}", args.len()));
        }
        if let Some(since) = query.since {
            args.push(SqlValue::Text(fmt_ts(since)));
            sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
        }
        if let Some(before) = query.before {
            args.push(SqlValue::Integer(before));
            sql.push_str(&format!(" AND id < ?{}", args.len()));
        }

        let limit = query
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);
        args.push(SqlValue::Integer(limit as i64));
        sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", args.len()));
        args.push(SqlValue::Integer(query.offset.unwrap_or(0) as i64));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(args), row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Events with id greater than `after_id`, oldest first
    pub fn events_after(&self, after_id: i64, limit: usize) -> HubResult<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM events WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        let events = stmt
            .query_map(params![after_id, limit as i64], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn get(&self, id: i64) -> HubResult<Event> {
        self.lock()
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![id],
                row_to_event,
            )
            .optional()?
            .ok_or_else(|| HubError::not_found("event", id.to_string()))
    }

    /// Id of the newest event (0 when empty)
    pub fn latest_id(&self) -> HubResult<i64> {
        let id: Option<i64> = self
            .lock()
            .query_row("SELECT MAX(id) FROM events", [], |row| row.get(0))?;
        Ok(id.unwrap_or(0))
    }

    /// Last event id a named consumer has fully processed
    pub fn load_offset(&self, consumer: &str) -> HubResult<Option<i64>> {
        let offset = self
            .lock()
            .query_row(
                "SELECT last_event_id FROM consumer_offsets WHERE consumer = ?1",
                params![consumer],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset)
    }

    pub fn save_offset(&self, consumer: &str, last_event_id: i64) -> HubResult<()> {
        self.lock().execute(
            "INSERT INTO consumer_offsets (consumer, last_event_id) VALUES (?1, ?2)
             ON CONFLICT(consumer) DO UPDATE SET last_event_id = excluded.last_event_id",
            params![consumer, last_event_id],
        )?;
        Ok(())
    }

    /// Liveness check for `/health`
    pub fn ping(&self) -> HubResult<()> {
        self.lock().query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

pub(crate) fn configure_connection(conn: &Connection) -> HubResult<()> {
    // journal_mode returns a row, so it cannot go through execute()
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous = FULL; PRAGMA busy_timeout = 5000;")?;
    Ok(())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let payload: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(Event {
        id: row.get(0)?,
        event_type: row.get(1)?,
        source: row.get(2)?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: parse_ts(&created_at).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        hops: row.get(5)?,
        idempotency_key: row.get(6)?,
    })
}

/// Fixed-width RFC 3339 so text comparison matches time order
pub(crate) fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

/// Dedupe key for a producer idempotency key (first 16 hex chars of SHA256)
pub fn dedupe_key(source: &str, idempotency_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(idempotency_key.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
