use chrono::{DateTime, Utc};
use qw_quota::error::Result;
use qw_quota::{Cycle, MemoryStore, QuotaStore, ResetMarker, Session, Snapshot, StoreError};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Store whose writes can be switched off, to exercise degraded operation.
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing: Mutex<bool>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: Mutex::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn check(&self) -> Result<()> {
        if *self.failing.lock().unwrap() {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        Ok(())
    }
}

impl QuotaStore for FlakyStore {
    fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<i64> {
        self.check()?;
        self.inner.insert_snapshot(snapshot)
    }

    fn latest_snapshot(&self, provider: &str) -> Result<Option<Snapshot>> {
        self.inner.latest_snapshot(provider)
    }

    fn active_cycle(&self, provider: &str, key: &str) -> Result<Option<Cycle>> {
        self.inner.active_cycle(provider, key)
    }

    fn open_cycle(
        &self,
        provider: &str,
        key: &str,
        start: DateTime<Utc>,
        marker: Option<&ResetMarker>,
        usage: f64,
    ) -> Result<()> {
        self.check()?;
        self.inner.open_cycle(provider, key, start, marker, usage)
    }

    fn update_cycle(
        &self,
        provider: &str,
        key: &str,
        peak: f64,
        delta: f64,
    ) -> Result<()> {
        self.check()?;
        self.inner.update_cycle(provider, key, peak, delta)
    }

    fn close_cycle(
        &self,
        provider: &str,
        key: &str,
        end: DateTime<Utc>,
        peak: f64,
        delta: f64,
    ) -> Result<bool> {
        self.check()?;
        self.inner.close_cycle(provider, key, end, peak, delta)
    }

    fn cycle_history(
        &self,
        provider: &str,
        key: &str,
        limit: usize,
    ) -> Result<Vec<Cycle>> {
        self.inner.cycle_history(provider, key, limit)
    }

    fn active_session(&self, provider: &str) -> Result<Option<Session>> {
        self.inner.active_session(provider)
    }

    fn open_session(
        &self,
        id: Uuid,
        provider: &str,
        started_at: DateTime<Utc>,
        idle_timeout: Duration,
    ) -> Result<()> {
        self.check()?;
        self.inner.open_session(id, provider, started_at, idle_timeout)
    }

    fn touch_session(
        &self,
        id: Uuid,
        max_usage: &BTreeMap<String, f64>,
    ) -> Result<()> {
        self.check()?;
        self.inner.touch_session(id, max_usage)
    }

    fn close_session(&self, id: Uuid, ended_at: DateTime<Utc>) -> Result<bool> {
        self.check()?;
        self.inner.close_session(id, ended_at)
    }

    fn close_orphaned_sessions(
        &self,
        provider: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<usize> {
        self.check()?;
        self.inner.close_orphaned_sessions(provider, ended_at)
    }

    fn session_history(
        &self,
        provider: &str,
        limit: usize,
    ) -> Result<Vec<Session>> {
        self.inner.session_history(provider, limit)
    }
}
