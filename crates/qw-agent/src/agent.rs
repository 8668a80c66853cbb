use crate::source::SnapshotSource;
use chrono::Utc;
use qw_quota::{
    AccountantConfig, CycleTracker, QuotaStore, ResetSink, SessionAccountant, TrackerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Result of a single tick of the poll pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed { resets: usize, warnings: usize },
    FetchFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub polls: u64,
    pub fetch_failures: u64,
    pub resets: u64,
    pub store_warnings: u64,
}

/// One provider's sequential poll loop.
///
/// Owns that provider's tracker and accountant outright, so nothing in the
/// pipeline needs a lock. The store is the only shared piece.
pub struct PollAgent {
    provider: String,
    source: Arc<dyn SnapshotSource>,
    store: Arc<dyn QuotaStore>,
    tracker: CycleTracker,
    accountant: SessionAccountant,
    interval: Duration,
    start_delay: Duration,
    stats: AgentStats,
}

impl PollAgent {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        store: Arc<dyn QuotaStore>,
        tracker_config: TrackerConfig,
        accountant_config: AccountantConfig,
    ) -> Self {
        let provider = source.provider().to_string();
        let interval = tracker_config.poll_interval;
        Self {
            tracker: CycleTracker::new(provider.clone(), store.clone(), tracker_config),
            accountant: SessionAccountant::new(provider.clone(), store.clone(), accountant_config),
            provider,
            source,
            store,
            interval,
            start_delay: Duration::ZERO,
            stats: AgentStats::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResetSink>) -> Self {
        self.tracker = self.tracker.with_sink(sink);
        self
    }

    /// Delays the first poll, used to stagger agents sharing one database.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn tracker(&self) -> &CycleTracker {
        &self.tracker
    }

    pub fn accountant(&self) -> &SessionAccountant {
        &self.accountant
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    /// Runs one fetch → insert → process → touch pass.
    pub async fn poll_once(&mut self) -> PollOutcome {
        let expired = self.accountant.expire_idle(Utc::now());
        self.stats.store_warnings += expired.warnings.len() as u64;

        let mut snapshot = match self.source.fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.stats.fetch_failures += 1;
                tracing::warn!(provider = %self.provider, error = %e, "failed to fetch quotas");
                return PollOutcome::FetchFailed;
            }
        };
        if snapshot.provider != self.provider {
            tracing::warn!(
                provider = %self.provider,
                reported = %snapshot.provider,
                "source reported a different provider name; using the configured one"
            );
            snapshot.provider = self.provider.clone();
        }

        let mut warnings = 0;
        if let Err(e) = self.store.insert_snapshot(&snapshot) {
            tracing::warn!(provider = %self.provider, error = %e, "failed to insert snapshot");
            warnings += 1;
        }

        let report = self.tracker.process(&snapshot);
        warnings += report.warnings.len();

        let touch = self.accountant.touch(&snapshot);
        warnings += touch.warnings.len();

        self.stats.polls += 1;
        self.stats.resets += report.resets.len() as u64;
        self.stats.store_warnings += warnings as u64;

        tracing::debug!(
            provider = %self.provider,
            quotas = snapshot.quotas.len(),
            resets = report.resets.len(),
            anomalies = report.anomalies.len(),
            session_id = %touch.session_id,
            "poll complete"
        );

        PollOutcome::Completed {
            resets: report.resets.len(),
            warnings,
        }
    }

    /// Polls until `cancel` fires, then closes the open session.
    ///
    /// Cancellation is only observed between ticks; an in-flight poll always
    /// runs to completion.
    pub async fn run(mut self, cancel: CancellationToken) -> AgentStats {
        if let Err(e) = self.accountant.recover() {
            tracing::warn!(provider = %self.provider, error = %e, "orphan session recovery failed");
        }

        tracing::info!(
            provider = %self.provider,
            interval_secs = self.interval.as_secs(),
            "poll agent started"
        );

        if !self.start_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.shutdown();
                }
                _ = tokio::time::sleep(self.start_delay) => {}
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        self.shutdown()
    }

    fn shutdown(mut self) -> AgentStats {
        let closed = self.accountant.close(Utc::now());
        self.stats.store_warnings += closed.warnings.len() as u64;
        tracing::info!(
            provider = %self.provider,
            polls = self.stats.polls,
            resets = self.stats.resets,
            "poll agent stopped"
        );
        self.stats
    }
}
