use crate::error::Result;
use crate::types::{Cycle, ResetMarker, Session, Snapshot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Durable home for snapshots, cycles and sessions.
///
/// Implementations serialize their own writes; the tracker and accountant
/// only rely on a read-modify-write of one key's active cycle being atomic
/// with respect to writers of that same key.
pub trait QuotaStore: Send + Sync {
    /// Append-only snapshot log. Returns the row id.
    fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<i64>;

    fn latest_snapshot(&self, provider: &str) -> Result<Option<Snapshot>>;

    fn active_cycle(&self, provider: &str, quota_key: &str) -> Result<Option<Cycle>>;

    /// Fails with `CycleAlreadyActive` if the key already has an open cycle.
    fn open_cycle(
        &self,
        provider: &str,
        quota_key: &str,
        cycle_start: DateTime<Utc>,
        reset_marker: Option<&ResetMarker>,
        initial_usage: f64,
    ) -> Result<()>;

    /// Persists running peak/delta of the active cycle. No-op without one.
    fn update_cycle(&self, provider: &str, quota_key: &str, peak: f64, total_delta: f64)
        -> Result<()>;

    /// Finalizes the active cycle. Returns `false` (and changes nothing) if
    /// there was no active cycle to close.
    fn close_cycle(
        &self,
        provider: &str,
        quota_key: &str,
        cycle_end: DateTime<Utc>,
        peak: f64,
        total_delta: f64,
    ) -> Result<bool>;

    /// Closed cycles, most recent first, at most `limit` rows.
    fn cycle_history(&self, provider: &str, quota_key: &str, limit: usize) -> Result<Vec<Cycle>>;

    fn active_session(&self, provider: &str) -> Result<Option<Session>>;

    /// Fails with `SessionAlreadyOpen` if `provider` has an open session.
    fn open_session(
        &self,
        id: Uuid,
        provider: &str,
        started_at: DateTime<Utc>,
        idle_timeout: Duration,
    ) -> Result<()>;

    /// Counts one snapshot and raises the stored maxima to `max_usage`
    /// where larger. Rejects closed sessions with `SessionClosed`.
    fn touch_session(&self, id: Uuid, max_usage: &BTreeMap<String, f64>) -> Result<()>;

    /// Returns `false` (and changes nothing) if the session was already closed.
    fn close_session(&self, id: Uuid, ended_at: DateTime<Utc>) -> Result<bool>;

    /// Closes every open session of `provider` at `ended_at`.
    fn close_orphaned_sessions(&self, provider: &str, ended_at: DateTime<Utc>) -> Result<usize>;

    /// Sessions for `provider`, most recent first.
    fn session_history(&self, provider: &str, limit: usize) -> Result<Vec<Session>>;
}
