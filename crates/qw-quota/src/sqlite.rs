use crate::error::{Result, StoreError};
use crate::migrations;
use crate::store::QuotaStore;
use crate::types::{merge_max_usage, Cycle, QuotaObservation, ResetMarker, Session, Snapshot};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

struct CycleRow {
    provider: String,
    quota_key: String,
    cycle_start: String,
    cycle_end: Option<String>,
    reset_marker_json: Option<String>,
    peak_usage: f64,
    total_delta: f64,
}

const CYCLE_COLUMNS: &str =
    "provider, quota_key, cycle_start, cycle_end, reset_marker_json, peak_usage, total_delta";

impl CycleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            provider: row.get(0)?,
            quota_key: row.get(1)?,
            cycle_start: row.get(2)?,
            cycle_end: row.get(3)?,
            reset_marker_json: row.get(4)?,
            peak_usage: row.get(5)?,
            total_delta: row.get(6)?,
        })
    }

    fn into_cycle(self) -> Result<Cycle> {
        let reset_marker_at_open = match self.reset_marker_json {
            Some(json) => Some(serde_json::from_str::<ResetMarker>(&json)?),
            None => None,
        };
        Ok(Cycle {
            provider: self.provider,
            quota_key: self.quota_key,
            cycle_start: parse_ts(&self.cycle_start)?,
            cycle_end: self.cycle_end.as_deref().map(parse_ts).transpose()?,
            reset_marker_at_open,
            peak_usage: self.peak_usage,
            total_delta: self.total_delta,
        })
    }
}

struct SessionRow {
    id: String,
    provider: String,
    started_at: String,
    ended_at: Option<String>,
    idle_timeout_secs: i64,
    max_usage_json: String,
    snapshot_count: i64,
}

const SESSION_COLUMNS: &str =
    "id, provider, started_at, ended_at, idle_timeout_secs, max_usage_json, snapshot_count";

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            provider: row.get(1)?,
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            idle_timeout_secs: row.get(4)?,
            max_usage_json: row.get(5)?,
            snapshot_count: row.get(6)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Unavailable(format!("bad session id {}: {e}", self.id)))?;
        Ok(Session {
            id,
            provider: self.provider,
            started_at: parse_ts(&self.started_at)?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(0) as u64),
            max_usage: serde_json::from_str(&self.max_usage_json)?,
            snapshot_count: self.snapshot_count.max(0) as u64,
        })
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl QuotaStore for SqliteStore {
    fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<i64> {
        let quotas_json = serde_json::to_string(&snapshot.quotas)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO snapshots (provider, captured_at, quotas_json) VALUES (?1, ?2, ?3)",
            params![snapshot.provider, format_ts(snapshot.captured_at), quotas_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn latest_snapshot(&self, provider: &str) -> Result<Option<Snapshot>> {
        let row = self
            .conn()
            .query_row(
                "SELECT captured_at, quotas_json FROM snapshots
                 WHERE provider = ?1 ORDER BY captured_at DESC, id DESC LIMIT 1",
                [provider],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((captured_at, quotas_json)) = row else {
            return Ok(None);
        };
        let quotas: BTreeMap<String, QuotaObservation> = serde_json::from_str(&quotas_json)?;
        Ok(Some(Snapshot {
            provider: provider.to_string(),
            captured_at: parse_ts(&captured_at)?,
            quotas,
        }))
    }

    fn active_cycle(&self, provider: &str, quota_key: &str) -> Result<Option<Cycle>> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {CYCLE_COLUMNS} FROM cycles
                     WHERE provider = ?1 AND quota_key = ?2 AND cycle_end IS NULL"
                ),
                params![provider, quota_key],
                CycleRow::from_row,
            )
            .optional()?;
        row.map(CycleRow::into_cycle).transpose()
    }

    fn open_cycle(
        &self,
        provider: &str,
        quota_key: &str,
        cycle_start: DateTime<Utc>,
        reset_marker: Option<&ResetMarker>,
        initial_usage: f64,
    ) -> Result<()> {
        let marker_json = reset_marker.map(serde_json::to_string).transpose()?;
        let result = self.conn().execute(
            "INSERT INTO cycles (provider, quota_key, cycle_start, reset_marker_json, peak_usage, total_delta)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                provider,
                quota_key,
                format_ts(cycle_start),
                marker_json,
                initial_usage
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(StoreError::CycleAlreadyActive {
                provider: provider.to_string(),
                quota_key: quota_key.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn update_cycle(
        &self,
        provider: &str,
        quota_key: &str,
        peak: f64,
        total_delta: f64,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE cycles SET peak_usage = ?1, total_delta = ?2
             WHERE provider = ?3 AND quota_key = ?4 AND cycle_end IS NULL",
            params![peak, total_delta, provider, quota_key],
        )?;
        Ok(())
    }

    fn close_cycle(
        &self,
        provider: &str,
        quota_key: &str,
        cycle_end: DateTime<Utc>,
        peak: f64,
        total_delta: f64,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE cycles SET cycle_end = ?1, peak_usage = ?2, total_delta = ?3
             WHERE provider = ?4 AND quota_key = ?5 AND cycle_end IS NULL",
            params![format_ts(cycle_end), peak, total_delta, provider, quota_key],
        )?;
        Ok(changed > 0)
    }

    fn cycle_history(&self, provider: &str, quota_key: &str, limit: usize) -> Result<Vec<Cycle>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CYCLE_COLUMNS} FROM cycles
             WHERE provider = ?1 AND quota_key = ?2 AND cycle_end IS NOT NULL
             ORDER BY cycle_start DESC, id DESC
             LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![provider, quota_key, limit as i64],
                CycleRow::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(CycleRow::into_cycle).collect()
    }

    fn active_session(&self, provider: &str) -> Result<Option<Session>> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE provider = ?1 AND ended_at IS NULL
                     ORDER BY started_at DESC LIMIT 1"
                ),
                [provider],
                SessionRow::from_row,
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    fn open_session(
        &self,
        id: Uuid,
        provider: &str,
        started_at: DateTime<Utc>,
        idle_timeout: Duration,
    ) -> Result<()> {
        let result = self.conn().execute(
            "INSERT INTO sessions (id, provider, started_at, idle_timeout_secs)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                provider,
                format_ts(started_at),
                idle_timeout.as_secs() as i64
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => {
                Err(StoreError::SessionAlreadyOpen(provider.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn touch_session(&self, id: Uuid, max_usage: &BTreeMap<String, f64>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current = tx
            .query_row(
                "SELECT ended_at, max_usage_json FROM sessions WHERE id = ?1",
                [id.to_string()],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((ended_at, max_usage_json)) = current else {
            return Err(StoreError::SessionNotFound(id));
        };
        if ended_at.is_some() {
            return Err(StoreError::SessionClosed(id));
        }
        let mut stored: BTreeMap<String, f64> = serde_json::from_str(&max_usage_json)?;
        merge_max_usage(&mut stored, max_usage);
        tx.execute(
            "UPDATE sessions SET snapshot_count = snapshot_count + 1, max_usage_json = ?1
             WHERE id = ?2",
            params![serde_json::to_string(&stored)?, id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn close_session(&self, id: Uuid, ended_at: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE sessions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
            params![format_ts(ended_at), id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn close_orphaned_sessions(&self, provider: &str, ended_at: DateTime<Utc>) -> Result<usize> {
        let changed = self.conn().execute(
            "UPDATE sessions SET ended_at = ?1 WHERE provider = ?2 AND ended_at IS NULL",
            params![format_ts(ended_at), provider],
        )?;
        Ok(changed)
    }

    fn session_history(&self, provider: &str, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE provider = ?1 ORDER BY started_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![provider, limit as i64], SessionRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }
}
