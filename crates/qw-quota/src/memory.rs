use crate::error::{Result, StoreError};
use crate::store::QuotaStore;
use crate::types::{merge_max_usage, Cycle, ResetMarker, Session, Snapshot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// In-memory reference implementation of [`QuotaStore`].
///
/// Same observable semantics as the SQLite store, including the
/// one-active-cycle and one-open-session checks, without durability.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    snapshots: Vec<Snapshot>,
    cycles: Vec<Cycle>,
    sessions: Vec<Session>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every cycle for the key, open or closed, in insertion order.
    pub fn all_cycles(&self, provider: &str, quota_key: &str) -> Vec<Cycle> {
        self.inner()
            .cycles
            .iter()
            .filter(|c| c.provider == provider && c.quota_key == quota_key)
            .cloned()
            .collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner().snapshots.len()
    }
}

impl Inner {
    fn active_cycle_mut(&mut self, provider: &str, quota_key: &str) -> Option<&mut Cycle> {
        self.cycles
            .iter_mut()
            .find(|c| c.provider == provider && c.quota_key == quota_key && c.is_active())
    }

    fn session_mut(&mut self, id: Uuid) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }
}

impl QuotaStore for MemoryStore {
    fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<i64> {
        let mut inner = self.inner();
        inner.snapshots.push(snapshot.clone());
        Ok(inner.snapshots.len() as i64)
    }

    fn latest_snapshot(&self, provider: &str) -> Result<Option<Snapshot>> {
        Ok(self
            .inner()
            .snapshots
            .iter()
            .filter(|s| s.provider == provider)
            .max_by_key(|s| s.captured_at)
            .cloned())
    }

    fn active_cycle(&self, provider: &str, quota_key: &str) -> Result<Option<Cycle>> {
        Ok(self
            .inner()
            .active_cycle_mut(provider, quota_key)
            .cloned())
    }

    fn open_cycle(
        &self,
        provider: &str,
        quota_key: &str,
        cycle_start: DateTime<Utc>,
        reset_marker: Option<&ResetMarker>,
        initial_usage: f64,
    ) -> Result<()> {
        let mut inner = self.inner();
        if inner.active_cycle_mut(provider, quota_key).is_some() {
            return Err(StoreError::CycleAlreadyActive {
                provider: provider.to_string(),
                quota_key: quota_key.to_string(),
            });
        }
        inner.cycles.push(Cycle::open(
            provider,
            quota_key,
            cycle_start,
            reset_marker.cloned(),
            initial_usage,
        ));
        Ok(())
    }

    fn update_cycle(
        &self,
        provider: &str,
        quota_key: &str,
        peak: f64,
        total_delta: f64,
    ) -> Result<()> {
        if let Some(cycle) = self.inner().active_cycle_mut(provider, quota_key) {
            cycle.peak_usage = peak;
            cycle.total_delta = total_delta;
        }
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
        let mut inner = self.inner();
        let Some(cycle) = inner.active_cycle_mut(provider, quota_key) else {
            return Ok(false);
        };
        cycle.cycle_end = Some(cycle_end);
        cycle.peak_usage = peak;
        cycle.total_delta = total_delta;
        Ok(true)
    }

    fn cycle_history(&self, provider: &str, quota_key: &str, limit: usize) -> Result<Vec<Cycle>> {
        let inner = self.inner();
        let mut closed: Vec<Cycle> = inner
            .cycles
            .iter()
            .filter(|c| c.provider == provider && c.quota_key == quota_key && !c.is_active())
            .cloned()
            .collect();
        // Stable sort keeps later inserts ahead once reversed.
        closed.sort_by_key(|c| c.cycle_start);
        closed.reverse();
        closed.truncate(limit);
        Ok(closed)
    }

    fn active_session(&self, provider: &str) -> Result<Option<Session>> {
        Ok(self
            .inner()
            .sessions
            .iter()
            .filter(|s| s.provider == provider && s.is_open())
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    fn open_session(
        &self,
        id: Uuid,
        provider: &str,
        started_at: DateTime<Utc>,
        idle_timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.inner();
        if inner
            .sessions
            .iter()
            .any(|s| s.provider == provider && s.is_open())
        {
            return Err(StoreError::SessionAlreadyOpen(provider.to_string()));
        }
        inner
            .sessions
            .push(Session::open(id, provider, started_at, idle_timeout));
        Ok(())
    }

    fn touch_session(&self, id: Uuid, max_usage: &BTreeMap<String, f64>) -> Result<()> {
        let mut inner = self.inner();
        let session = inner
            .session_mut(id)
            .ok_or(StoreError::SessionNotFound(id))?;
        if !session.is_open() {
            return Err(StoreError::SessionClosed(id));
        }
        session.snapshot_count += 1;
        merge_max_usage(&mut session.max_usage, max_usage);
        Ok(())
    }

    fn close_session(&self, id: Uuid, ended_at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner();
        match inner.session_mut(id) {
            Some(session) if session.is_open() => {
                session.ended_at = Some(ended_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn close_orphaned_sessions(&self, provider: &str, ended_at: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner();
        let mut closed = 0;
        for session in inner
            .sessions
            .iter_mut()
            .filter(|s| s.provider == provider && s.is_open())
        {
            session.ended_at = Some(ended_at);
            closed += 1;
        }
        Ok(closed)
    }

    fn session_history(&self, provider: &str, limit: usize) -> Result<Vec<Session>> {
        let inner = self.inner();
        let mut sessions: Vec<Session> = inner
            .sessions
            .iter()
            .filter(|s| s.provider == provider)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions.reverse();
        sessions.truncate(limit);
        Ok(sessions)
    }
}
