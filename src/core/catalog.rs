//! Administrative tables: rules, schedules, push targets, pipelines and the
//! rule execution log.
//!
//! Rules, schedules and push targets are stored as JSON documents with a
//! `version` column for optimistic concurrency. The hot fields the engine
//! writes on every firing (`last_fired`) live in their own column so a
//! firing never races an administrative edit.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::event_store::{configure_connection, fmt_ts, parse_ts};
use crate::domain::{
    ExecutionResult, Pipeline, PushTarget, PushTargetPatch, Rule, RuleExecutionRecord, RulePatch,
    Schedule, SchedulePatch, Transition,
};
use crate::error::{HubError, HubResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL,
    version INTEGER NOT NULL,
    body TEXT NOT NULL,
    last_fired TEXT
);
CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL,
    version INTEGER NOT NULL,
    body TEXT NOT NULL,
    last_fired TEXT
);
CREATE TABLE IF NOT EXISTS push_targets (
    id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL,
    version INTEGER NOT NULL,
    body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rule_executions (
    id INTEGER PRIMARY KEY,
    rule_id TEXT NOT NULL,
    triggering_event_id INTEGER NOT NULL,
    action_taken TEXT NOT NULL,
    success INTEGER NOT NULL,
    detail TEXT NOT NULL,
    fired_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rule_executions_rule ON rule_executions(rule_id, id);

CREATE TABLE IF NOT EXISTS pipelines (
    job_id TEXT PRIMARY KEY,
    stage TEXT NOT NULL,
    last_transition_at TEXT NOT NULL,
    stalled INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_event_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pipeline_transitions (
    id INTEGER PRIMARY KEY,
    job_id TEXT NOT NULL,
    from_stage TEXT,
    to_stage TEXT NOT NULL,
    event_id INTEGER NOT NULL,
    at TEXT NOT NULL,
    reset INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pipeline_transitions_job ON pipeline_transitions(job_id, id);

CREATE TABLE IF NOT EXISTS track_requests (
    event_id INTEGER PRIMARY KEY
);
";

/// Document tables share one layout
#[derive(Debug, Clone, Copy)]
enum DocTable {
    Rules,
    Schedules,
    PushTargets,
}

impl DocTable {
    fn name(self) -> &'static str {
        match self {
            Self::Rules => "rules",
            Self::Schedules => "schedules",
            Self::PushTargets => "push_targets",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Rules => "rule",
            Self::Schedules => "schedule",
            Self::PushTargets => "push target",
        }
    }

    /// Column read back as the firing time; push targets have none
    fn fired_column(self) -> &'static str {
        match self {
            Self::Rules | Self::Schedules => "last_fired",
            Self::PushTargets => "NULL",
        }
    }
}

/// SQLite-backed administrative store
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: &Path) -> HubResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> HubResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> HubResult<Self> {
        configure_connection(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Generic document helpers
    // ------------------------------------------------------------------

    fn insert_doc<T: Serialize>(
        &self,
        table: DocTable,
        id: &str,
        enabled: bool,
        version: u64,
        doc: &T,
    ) -> HubResult<()> {
        let body = serde_json::to_string(doc)?;
        self.lock().execute(
            &format!(
                "INSERT INTO {} (id, enabled, version, body) VALUES (?1, ?2, ?3, ?4)",
                table.name()
            ),
            params![id, enabled, version as i64, body],
        )?;
        Ok(())
    }

    fn get_doc<T: DeserializeOwned>(
        &self,
        table: DocTable,
        id: &str,
    ) -> HubResult<(T, Option<DateTime<Utc>>)> {
        let row: Option<(String, Option<String>)> = self
            .lock()
            .query_row(
                &format!(
                    "SELECT body, {} FROM {} WHERE id = ?1",
                    table.fired_column(),
                    table.name()
                ),
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (body, fired) = row.ok_or_else(|| HubError::not_found(table.kind(), id))?;
        Ok((serde_json::from_str(&body)?, parse_optional_ts(fired)))
    }

    fn list_docs<T: DeserializeOwned>(
        &self,
        table: DocTable,
        enabled_only: bool,
    ) -> HubResult<Vec<(T, Option<DateTime<Utc>>)>> {
        let sql = format!(
            "SELECT body, {} FROM {} {} ORDER BY rowid ASC",
            table.fired_column(),
            table.name(),
            if enabled_only { "WHERE enabled = 1" } else { "" }
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        rows.into_iter()
            .map(|(body, fired)| Ok((serde_json::from_str(&body)?, parse_optional_ts(fired))))
            .collect()
    }

    /// Write back an edited document if nobody else bumped the version
    fn replace_doc<T: Serialize>(
        &self,
        table: DocTable,
        id: &str,
        old_version: u64,
        new_version: u64,
        enabled: bool,
        doc: &T,
    ) -> HubResult<()> {
        let body = serde_json::to_string(doc)?;
        let changed = self.lock().execute(
            &format!(
                "UPDATE {} SET enabled = ?1, version = ?2, body = ?3 WHERE id = ?4 AND version = ?5",
                table.name()
            ),
            params![enabled, new_version as i64, body, id, old_version as i64],
        )?;
        if changed == 0 {
            return Err(HubError::Conflict {
                kind: table.kind(),
                id: id.to_string(),
                expected: old_version,
                actual: old_version + 1,
            });
        }
        Ok(())
    }

    fn delete_doc(&self, table: DocTable, id: &str) -> HubResult<()> {
        let deleted = self.lock().execute(
            &format!("DELETE FROM {} WHERE id = ?1", table.name()),
            params![id],
        )?;
        if deleted == 0 {
            return Err(HubError::not_found(table.kind(), id));
        }
        Ok(())
    }

    fn set_last_fired(&self, table: DocTable, id: &str, at: DateTime<Utc>) -> HubResult<()> {
        self.lock().execute(
            &format!("UPDATE {} SET last_fired = ?1 WHERE id = ?2", table.name()),
            params![fmt_ts(at), id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    pub fn insert_rule(&self, rule: &Rule) -> HubResult<()> {
        self.insert_doc(DocTable::Rules, &rule.id, rule.enabled, rule.version, rule)
    }

    pub fn get_rule(&self, id: &str) -> HubResult<Rule> {
        let (mut rule, fired): (Rule, _) = self.get_doc(DocTable::Rules, id)?;
        rule.last_fired_at = fired;
        Ok(rule)
    }

    pub fn list_rules(&self) -> HubResult<Vec<Rule>> {
        self.rules(false)
    }

    pub fn enabled_rules(&self) -> HubResult<Vec<Rule>> {
        self.rules(true)
    }

    fn rules(&self, enabled_only: bool) -> HubResult<Vec<Rule>> {
        Ok(self
            .list_docs::<Rule>(DocTable::Rules, enabled_only)?
            .into_iter()
            .map(|(mut rule, fired)| {
                rule.last_fired_at = fired;
                rule
            })
            .collect())
    }

    pub fn update_rule(&self, id: &str, patch: RulePatch, now: DateTime<Utc>) -> HubResult<Rule> {
        let mut rule = self.get_rule(id)?;
        let old_version = rule.version;
        patch.apply(&mut rule, now)?;
        self.replace_doc(DocTable::Rules, id, old_version, rule.version, rule.enabled, &rule)?;
        Ok(rule)
    }

    pub fn delete_rule(&self, id: &str) -> HubResult<()> {
        self.delete_doc(DocTable::Rules, id)
    }

    /// Persist a firing so cooldowns survive restarts
    pub fn record_rule_firing(&self, id: &str, at: DateTime<Utc>) -> HubResult<()> {
        self.set_last_fired(DocTable::Rules, id, at)
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    pub fn insert_schedule(&self, schedule: &Schedule) -> HubResult<()> {
        self.insert_doc(
            DocTable::Schedules,
            &schedule.id,
            schedule.enabled,
            schedule.version,
            schedule,
        )
    }

    pub fn get_schedule(&self, id: &str) -> HubResult<Schedule> {
        let (mut schedule, fired): (Schedule, _) = self.get_doc(DocTable::Schedules, id)?;
        schedule.last_fired_minute = fired;
        Ok(schedule)
    }

    pub fn list_schedules(&self) -> HubResult<Vec<Schedule>> {
        self.schedules(false)
    }

    pub fn enabled_schedules(&self) -> HubResult<Vec<Schedule>> {
        self.schedules(true)
    }

    fn schedules(&self, enabled_only: bool) -> HubResult<Vec<Schedule>> {
        Ok(self
            .list_docs::<Schedule>(DocTable::Schedules, enabled_only)?
            .into_iter()
            .map(|(mut schedule, fired)| {
                schedule.last_fired_minute = fired;
                schedule
            })
            .collect())
    }

    pub fn update_schedule(
        &self,
        id: &str,
        patch: SchedulePatch,
        now: DateTime<Utc>,
    ) -> HubResult<Schedule> {
        let mut schedule = self.get_schedule(id)?;
        let old_version = schedule.version;
        patch.apply(&mut schedule, now)?;
        self.replace_doc(
            DocTable::Schedules,
            id,
            old_version,
            schedule.version,
            schedule.enabled,
            &schedule,
        )?;
        Ok(schedule)
    }

    pub fn delete_schedule(&self, id: &str) -> HubResult<()> {
        self.delete_doc(DocTable::Schedules, id)
    }

    /// Claim a minute for a schedule.
    ///
    /// Returns false when the minute was already recorded, which is what
    /// makes re-delivered ticks idempotent.
    pub fn claim_schedule_minute(&self, id: &str, minute: DateTime<Utc>) -> HubResult<bool> {
        let minute = fmt_ts(minute);
        let changed = self.lock().execute(
            "UPDATE schedules SET last_fired = ?1
             WHERE id = ?2 AND (last_fired IS NULL OR last_fired <> ?1)",
            params![minute, id],
        )?;
        Ok(changed == 1)
    }

    // ------------------------------------------------------------------
    // Push targets
    // ------------------------------------------------------------------

    pub fn insert_push_target(&self, target: &PushTarget) -> HubResult<()> {
        self.insert_doc(
            DocTable::PushTargets,
            &target.id,
            target.enabled,
            target.version,
            target,
        )
    }

    pub fn get_push_target(&self, id: &str) -> HubResult<PushTarget> {
        Ok(self.get_doc::<PushTarget>(DocTable::PushTargets, id)?.0)
    }

    pub fn list_push_targets(&self) -> HubResult<Vec<PushTarget>> {
        Ok(self
            .list_docs::<PushTarget>(DocTable::PushTargets, false)?
            .into_iter()
            .map(|(target, _)| target)
            .collect())
    }

    pub fn enabled_push_targets(&self) -> HubResult<Vec<PushTarget>> {
        Ok(self
            .list_docs::<PushTarget>(DocTable::PushTargets, true)?
            .into_iter()
            .map(|(target, _)| target)
            .collect())
    }

    pub fn update_push_target(
        &self,
        id: &str,
        patch: PushTargetPatch,
        now: DateTime<Utc>,
    ) -> HubResult<PushTarget> {
        let mut target = self.get_push_target(id)?;
        let old_version = target.version;
        patch.apply(&mut target, now)?;
        self.replace_doc(
            DocTable::PushTargets,
            id,
            old_version,
            target.version,
            target.enabled,
            &target,
        )?;
        Ok(target)
    }

    pub fn delete_push_target(&self, id: &str) -> HubResult<()> {
        self.delete_doc(DocTable::PushTargets, id)
    }

    // ------------------------------------------------------------------
    // Execution log
    // ------------------------------------------------------------------

    /// Insert an execution record and return it with its assigned id
    pub fn insert_execution(&self, record: &RuleExecutionRecord) -> HubResult<RuleExecutionRecord> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO rule_executions (rule_id, triggering_event_id, action_taken, success, detail, fired_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.rule_id,
                record.triggering_event_id,
                record.action_taken,
                record.result.success,
                record.result.detail,
                fmt_ts(record.fired_at)
            ],
        )?;
        let mut stored = record.clone();
        stored.id = conn.last_insert_rowid();
        Ok(stored)
    }

    /// Most recent executions for a rule, newest first
    pub fn list_executions(&self, rule_id: &str, limit: usize) -> HubResult<Vec<RuleExecutionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, triggering_event_id, action_taken, success, detail, fired_at
             FROM rule_executions WHERE rule_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![rule_id, limit as i64], row_to_execution)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    /// Upsert a pipeline and append its transition atomically
    pub fn save_pipeline(&self, pipeline: &Pipeline, transition: Option<&Transition>) -> HubResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO pipelines (job_id, stage, last_transition_at, stalled, created_at, last_event_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(job_id) DO UPDATE SET
                stage = excluded.stage,
                last_transition_at = excluded.last_transition_at,
                stalled = excluded.stalled,
                last_event_id = excluded.last_event_id",
            params![
                pipeline.job_id,
                pipeline.stage,
                fmt_ts(pipeline.last_transition_at),
                pipeline.stalled,
                fmt_ts(pipeline.created_at),
                pipeline.last_event_id
            ],
        )?;
        if let Some(t) = transition {
            tx.execute(
                "INSERT INTO pipeline_transitions (job_id, from_stage, to_stage, event_id, at, reset)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![t.job_id, t.from_stage, t.to_stage, t.event_id, fmt_ts(t.at), t.reset],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_pipelines(&self) -> HubResult<Vec<Pipeline>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT job_id, stage, last_transition_at, stalled, created_at, last_event_id
             FROM pipelines ORDER BY last_transition_at DESC",
        )?;
        let pipelines = stmt
            .query_map([], row_to_pipeline)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pipelines)
    }

    pub fn list_transitions(&self, job_id: &str) -> HubResult<Vec<Transition>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT job_id, from_stage, to_stage, event_id, at, reset
             FROM pipeline_transitions WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let transitions = stmt
            .query_map(params![job_id], |row| {
                Ok(Transition {
                    job_id: row.get(0)?,
                    from_stage: row.get(1)?,
                    to_stage: row.get(2)?,
                    event_id: row.get(3)?,
                    at: ts_column(row, 4)?,
                    reset: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transitions)
    }

    /// Queue an event for the tracker on behalf of a `pipeline_track` action
    pub fn add_track_request(&self, event_id: i64) -> HubResult<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO track_requests (event_id) VALUES (?1)",
            params![event_id],
        )?;
        Ok(())
    }

    /// Whether `event_id` was queued. Clears it and anything older, which
    /// the tracker has already passed.
    pub fn take_track_request(&self, event_id: i64) -> HubResult<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let queued = tx
            .query_row(
                "SELECT 1 FROM track_requests WHERE event_id = ?1",
                params![event_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        tx.execute("DELETE FROM track_requests WHERE event_id <= ?1", params![event_id])?;
        tx.commit()?;
        Ok(queued)
    }

    pub fn ping(&self) -> HubResult<()> {
        self.lock().query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

fn parse_optional_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(|s| parse_ts(s).ok())
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<RuleExecutionRecord> {
    Ok(RuleExecutionRecord {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        triggering_event_id: row.get(2)?,
        action_taken: row.get(3)?,
        result: ExecutionResult {
            success: row.get(4)?,
            detail: row.get(5)?,
        },
        fired_at: ts_column(row, 6)?,
    })
}

fn row_to_pipeline(row: &Row<'_>) -> rusqlite::Result<Pipeline> {
    Ok(Pipeline {
        job_id: row.get(0)?,
        stage: row.get(1)?,
        last_transition_at: ts_column(row, 2)?,
        stalled: row.get(3)?,
        created_at: ts_column(row, 4)?,
        last_event_id: row.get(5)?,
    })
}
