use crate::error::{Result, StoreWarning};
use crate::store::QuotaStore;
use crate::types::{Session, Snapshot};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AccountantConfig {
    pub idle_timeout: Duration,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
pub struct TouchReport {
    pub session_id: Uuid,
    pub opened: bool,
    /// Session closed by this touch because the idle gap was exceeded.
    pub closed_previous: Option<Session>,
    /// Keys whose running maximum went up.
    pub raised: BTreeMap<String, f64>,
    pub warnings: Vec<StoreWarning>,
}

#[derive(Debug, Default)]
pub struct CloseReport {
    pub session: Option<Session>,
    pub warnings: Vec<StoreWarning>,
}

struct OpenSession {
    session: Session,
    last_touch: DateTime<Utc>,
    /// Whether `open_session` has succeeded for this session.
    in_store: bool,
}

/// Groups a provider's snapshots into sessions separated by idle gaps.
pub struct SessionAccountant {
    provider: String,
    store: Arc<dyn QuotaStore>,
    config: AccountantConfig,
    current: Option<OpenSession>,
    /// Closes not yet written, oldest first. Drained before any open.
    unsaved_closes: Vec<(Uuid, DateTime<Utc>)>,
    recovered: bool,
}

impl SessionAccountant {
    pub fn new(
        provider: impl Into<String>,
        store: Arc<dyn QuotaStore>,
        config: AccountantConfig,
    ) -> Self {
        Self {
            provider: provider.into(),
            store,
            config,
            current: None,
            unsaved_closes: Vec::new(),
            recovered: false,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Closes sessions left open by a previous process. Their real last
    /// activity is unknown, so they end at the current wall-clock time.
    pub fn recover(&mut self) -> Result<usize> {
        let closed = self
            .store
            .close_orphaned_sessions(&self.provider, Utc::now())?;
        self.recovered = true;
        if closed > 0 {
            tracing::info!(provider = %self.provider, closed, "closed orphaned sessions");
        }
        Ok(closed)
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref().map(|open| &open.session)
    }

    pub fn last_touch(&self) -> Option<DateTime<Utc>> {
        self.current.as_ref().map(|open| open.last_touch)
    }

    /// Records one successful poll.
    ///
    /// Opens a session when none is open, or when the gap since the last
    /// touch exceeds the idle timeout (the stale session ends at its last
    /// touch). Store failures land in `warnings`.
    pub fn touch(&mut self, snapshot: &Snapshot) -> TouchReport {
        let at = snapshot.captured_at;
        let mut warnings = Vec::new();

        if !self.recovered {
            if let Err(e) = self.recover() {
                self.warn(&mut warnings, "close_orphaned_sessions", &e);
                self.recovered = true;
            }
        }

        let closed_previous = if self.is_idle_at(at) {
            self.close_at_last_touch()
        } else {
            None
        };

        let opened = self.current.is_none();
        if opened {
            let session = Session::open(
                Uuid::new_v4(),
                self.provider.as_str(),
                at,
                self.config.idle_timeout,
            );
            tracing::info!(provider = %self.provider, session_id = %session.id, "opened session");
            self.current = Some(OpenSession {
                session,
                last_touch: at,
                in_store: false,
            });
        }
        let in_store = self.sync_store(&mut warnings);

        let usage: BTreeMap<String, f64> = snapshot
            .quotas
            .iter()
            .filter(|(_, observation)| observation.has_valid_usage())
            .map(|(key, observation)| (key.clone(), observation.usage))
            .collect();

        let mut raised = BTreeMap::new();
        let mut session_id = Uuid::nil();
        let mut persist = None;
        if let Some(open) = self.current.as_mut() {
            session_id = open.session.id;
            match open.session.record(&usage) {
                Ok(up) => {
                    raised = up;
                    open.last_touch = at;
                    persist = Some(open.session.max_usage.clone());
                }
                Err(e) => tracing::error!(provider = %self.provider, error = %e, "touch rejected"),
            }
        }
        if let Some(max_usage) = persist.filter(|_| in_store) {
            if let Err(e) = self.store.touch_session(session_id, &max_usage) {
                self.warn(&mut warnings, "touch_session", &e);
            }
        }

        TouchReport {
            session_id,
            opened,
            closed_previous,
            raised,
            warnings,
        }
    }

    /// Closes the open session at `ended_at`, typically on shutdown.
    pub fn close(&mut self, ended_at: DateTime<Utc>) -> CloseReport {
        let session = self
            .current
            .take()
            .map(|open| self.finish(open, ended_at, "closed session"));
        let mut warnings = Vec::new();
        self.flush_unsaved_closes(&mut warnings);
        CloseReport { session, warnings }
    }

    /// Closes the open session if it has been idle longer than the timeout
    /// as of `now`. The session ends at its last touch.
    pub fn expire_idle(&mut self, now: DateTime<Utc>) -> CloseReport {
        if !self.is_idle_at(now) {
            return CloseReport::default();
        }
        let session = self.close_at_last_touch();
        let mut warnings = Vec::new();
        self.flush_unsaved_closes(&mut warnings);
        CloseReport { session, warnings }
    }

    /// Closed sessions the store has not recorded yet.
    pub fn unsaved_closes(&self) -> usize {
        self.unsaved_closes.len()
    }

    fn is_idle_at(&self, now: DateTime<Utc>) -> bool {
        let Some(open) = &self.current else {
            return false;
        };
        match (now - open.last_touch).to_std() {
            Ok(gap) => gap > self.config.idle_timeout,
            Err(_) => false,
        }
    }

    fn close_at_last_touch(&mut self) -> Option<Session> {
        let open = self.current.take()?;
        let ended_at = open.last_touch;
        Some(self.finish(open, ended_at, "closed idle session"))
    }

    /// Ends `open` in memory and queues the store write.
    fn finish(&mut self, open: OpenSession, ended_at: DateTime<Utc>, message: &str) -> Session {
        let mut session = open.session;
        session.close(ended_at);
        if open.in_store {
            self.unsaved_closes.push((session.id, ended_at));
        }
        tracing::info!(
            provider = %self.provider,
            session_id = %session.id,
            snapshots = session.snapshot_count,
            "{message}"
        );
        session
    }

    /// Writes queued closes in order. Returns `false` if any remain.
    fn flush_unsaved_closes(&mut self, warnings: &mut Vec<StoreWarning>) -> bool {
        while let Some(&(id, ended_at)) = self.unsaved_closes.first() {
            if let Err(e) = self.store.close_session(id, ended_at) {
                self.warn(warnings, "close_session", &e);
                return false;
            }
            self.unsaved_closes.remove(0);
        }
        true
    }

    /// Makes sure the store holds the current session, opening it once
    /// earlier closes have gone through. Returns whether it is stored.
    fn sync_store(&mut self, warnings: &mut Vec<StoreWarning>) -> bool {
        if !self.flush_unsaved_closes(warnings) {
            return false;
        }
        let Some(open) = self.current.as_ref() else {
            return false;
        };
        if open.in_store {
            return true;
        }
        let session = &open.session;
        match self.store.open_session(
            session.id,
            &self.provider,
            session.started_at,
            session.idle_timeout,
        ) {
            Ok(()) => {
                if let Some(open) = self.current.as_mut() {
                    open.in_store = true;
                }
                true
            }
            Err(e) => {
                self.warn(warnings, "open_session", &e);
                false
            }
        }
    }

    fn warn(&self, warnings: &mut Vec<StoreWarning>, op: &'static str, err: &crate::StoreError) {
        tracing::warn!(provider = %self.provider, op, error = %err, "session store write failed");
        warnings.push(StoreWarning::new(op, err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::QuotaObservation;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600 + secs, 0).single().unwrap()
    }

    fn snap(secs: i64, usage: f64) -> Snapshot {
        Snapshot::new("codex", at(secs)).with_quota("primary", QuotaObservation::new(usage))
    }

    fn accountant(idle_secs: u64) -> (Arc<MemoryStore>, SessionAccountant) {
        let store = Arc::new(MemoryStore::new());
        let config = AccountantConfig {
            idle_timeout: Duration::from_secs(idle_secs),
        };
        let accountant = SessionAccountant::new("codex", store.clone(), config);
        (store, accountant)
    }

    #[test]
    fn first_touch_opens_session() {
        let (store, mut accountant) = accountant(600);
        let report = accountant.touch(&snap(0, 4.0));
        assert!(report.opened);
        assert!(report.warnings.is_empty());

        let session = store.active_session("codex").unwrap().unwrap();
        assert_eq!(session.id, report.session_id);
        assert_eq!(session.started_at, at(0));
        assert_eq!(session.snapshot_count, 1);
        assert_eq!(session.max_usage.get("primary"), Some(&4.0));
    }

    #[test]
    fn idle_gap_closes_at_last_touch() {
        let (store, mut accountant) = accountant(600);
        let first = accountant.touch(&snap(0, 1.0));
        accountant.touch(&snap(300, 2.0));
        let report = accountant.touch(&snap(1_000, 3.0));

        assert!(report.opened);
        let closed = report.closed_previous.unwrap();
        assert_eq!(closed.id, first.session_id);
        assert_eq!(closed.ended_at, Some(at(300)));

        let history = store.session_history("codex", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].ended_at, Some(at(300)));
        assert!(history[0].is_open());
    }

    #[test]
    fn gap_equal_to_timeout_keeps_session() {
        let (_store, mut accountant) = accountant(600);
        let first = accountant.touch(&snap(0, 1.0));
        let second = accountant.touch(&snap(600, 1.0));
        assert!(!second.opened);
        assert_eq!(second.session_id, first.session_id);
    }

    #[test]
    fn expire_idle_closes_without_new_touch() {
        let (store, mut accountant) = accountant(60);
        accountant.touch(&snap(0, 1.0));
        assert!(accountant.expire_idle(at(30)).session.is_none());

        let report = accountant.expire_idle(at(120));
        assert_eq!(report.session.unwrap().ended_at, Some(at(0)));
        assert!(accountant.current().is_none());
        assert!(store.active_session("codex").unwrap().is_none());
    }

    #[test]
    fn invalid_usage_is_not_a_maximum() {
        let (_store, mut accountant) = accountant(600);
        let snapshot = Snapshot::new("codex", at(0))
            .with_quota("primary", QuotaObservation::new(f64::NAN))
            .with_quota("secondary", QuotaObservation::new(7.0));
        accountant.touch(&snapshot);
        let session = accountant.current().unwrap();
        assert!(!session.max_usage.contains_key("primary"));
        assert_eq!(session.max_usage.get("secondary"), Some(&7.0));
    }

    #[test]
    fn close_twice_is_noop() {
        let (_store, mut accountant) = accountant(600);
        accountant.touch(&snap(0, 1.0));
        assert!(accountant.close(at(10)).session.is_some());
        assert!(accountant.close(at(20)).session.is_none());
    }
}
