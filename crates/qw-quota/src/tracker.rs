use crate::error::{Result, StoreWarning};
use crate::events::{LogResetSink, ResetSink};
use crate::store::QuotaStore;
use crate::types::{Cycle, QuotaObservation, ResetMarker, Snapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

const MIN_RATE_WINDOW: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Timestamp markers closer than this are the same billing period.
    pub jitter_tolerance: Duration,
    /// Expected spacing between snapshots; only used for gap reporting.
    pub poll_interval: Duration,
    pub gap_multiplier: f64,
    pub history_limit: usize,
    pub anomaly_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            jitter_tolerance: Duration::from_secs(5),
            poll_interval: Duration::from_secs(60),
            gap_multiplier: 3.0,
            history_limit: 50,
            anomaly_capacity: 64,
        }
    }
}

impl TrackerConfig {
    fn gap_threshold(&self) -> Duration {
        self.poll_interval.mul_f64(self.gap_multiplier.max(1.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Usage went down while the reset marker stayed put.
    UsageDrop { previous: f64, current: f64 },
    InvalidUsage { value: f64 },
    CoverageGap { elapsed_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub provider: String,
    pub quota_key: String,
    pub observed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AnomalyKind,
}

/// Whether a key has ever exposed a reset marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Known,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub provider: String,
    pub quota_key: String,
    pub completed_cycles: usize,
    pub avg_delta_per_cycle: f64,
    pub peak_usage: f64,
    pub total_tracked: f64,
    pub tracking_since: Option<DateTime<Utc>>,
    pub current_usage: Option<f64>,
    pub cadence: Cadence,
    /// Usage per hour over the active cycle; `None` until the cycle has
    /// run for at least 30 minutes with some consumption.
    pub current_rate: Option<f64>,
    pub active_cycle: Option<Cycle>,
}

/// What one call to [`CycleTracker::process`] did.
#[derive(Debug, Default)]
pub struct ProcessReport {
    pub opened: Vec<String>,
    pub resets: Vec<Cycle>,
    pub anomalies: Vec<Anomaly>,
    pub warnings: Vec<StoreWarning>,
}

impl ProcessReport {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty() && self.warnings.is_empty()
    }
}

struct KeyState {
    cycle: Cycle,
    /// `None` right after adopting a cycle from a previous process.
    last_usage: Option<f64>,
    last_marker: Option<ResetMarker>,
    last_seen: Option<DateTime<Utc>>,
    /// Whether the store has a row for `cycle`. Until it does, running
    /// totals are kept in memory only so they can't land on another row.
    in_store: bool,
    /// Stored peak/delta lag behind `cycle`.
    dirty: bool,
    /// Closed cycles the store hasn't recorded yet, oldest first.
    unsaved: Vec<UnsavedClose>,
}

struct UnsavedClose {
    cycle: Cycle,
    in_store: bool,
}

/// Turns a provider's snapshot stream into per-key billing cycles.
///
/// One tracker per provider. It is driven from a single poll loop and holds
/// no locks; the store handles cross-provider write ordering.
pub struct CycleTracker {
    provider: String,
    store: Arc<dyn QuotaStore>,
    sink: Arc<dyn ResetSink>,
    config: TrackerConfig,
    keys: HashMap<String, KeyState>,
    anomalies: VecDeque<Anomaly>,
}

impl CycleTracker {
    pub fn new(
        provider: impl Into<String>,
        store: Arc<dyn QuotaStore>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            provider: provider.into(),
            store,
            sink: Arc::new(LogResetSink),
            config,
            keys: HashMap::new(),
            anomalies: VecDeque::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResetSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Feeds one snapshot through the per-key state machines.
    ///
    /// Snapshots must arrive with non-decreasing `captured_at`. Store
    /// failures are reported as warnings; in-memory state advances anyway.
    pub fn process(&mut self, snapshot: &Snapshot) -> ProcessReport {
        let mut report = ProcessReport::default();
        let at = snapshot.captured_at;

        for (key, observation) in &snapshot.quotas {
            if !observation.has_valid_usage() {
                self.record_anomaly(
                    &mut report,
                    key,
                    at,
                    AnomalyKind::InvalidUsage {
                        value: observation.usage,
                    },
                );
                continue;
            }

            if !self.keys.contains_key(key) {
                match self.adopt_active_cycle(key, &mut report) {
                    Some(state) => {
                        self.keys.insert(key.clone(), state);
                    }
                    None => {
                        let state = self.open_cycle(key, at, observation, Vec::new(), &mut report);
                        self.keys.insert(key.clone(), state);
                        self.sync_store(key, &mut report);
                        continue;
                    }
                }
            }

            self.observe(key, at, observation, &mut report);
        }

        if !report.resets.is_empty() || !report.opened.is_empty() {
            tracing::debug!(
                provider = %self.provider,
                opened = report.opened.len(),
                resets = report.resets.len(),
                "processed snapshot"
            );
        }
        report
    }

    fn adopt_active_cycle(&self, key: &str, report: &mut ProcessReport) -> Option<KeyState> {
        match self.store.active_cycle(&self.provider, key) {
            Ok(Some(cycle)) => {
                tracing::info!(
                    provider = %self.provider,
                    quota = %key,
                    cycle_start = %cycle.cycle_start,
                    "adopted active cycle from store"
                );
                Some(KeyState {
                    last_marker: cycle.reset_marker_at_open.clone(),
                    cycle,
                    last_usage: None,
                    last_seen: None,
                    in_store: true,
                    dirty: false,
                    unsaved: Vec::new(),
                })
            }
            Ok(None) => None,
            Err(e) => {
                self.warn(report, "active_cycle", &e);
                None
            }
        }
    }

    /// Starts a cycle in memory. The store row is written by `sync_store`.
    fn open_cycle(
        &self,
        key: &str,
        at: DateTime<Utc>,
        observation: &QuotaObservation,
        unsaved: Vec<UnsavedClose>,
        report: &mut ProcessReport,
    ) -> KeyState {
        let marker = observation.reset_marker.clone();
        let cycle = Cycle::open(
            self.provider.as_str(),
            key,
            at,
            marker.clone(),
            observation.usage,
        );
        tracing::info!(
            provider = %self.provider,
            quota = %key,
            usage = observation.usage,
            has_marker = marker.is_some(),
            "opened quota cycle"
        );
        report.opened.push(key.to_string());
        KeyState {
            cycle,
            last_usage: Some(observation.usage),
            last_marker: marker,
            last_seen: Some(at),
            in_store: false,
            dirty: false,
            unsaved,
        }
    }

    fn observe(
        &mut self,
        key: &str,
        at: DateTime<Utc>,
        observation: &QuotaObservation,
        report: &mut ProcessReport,
    ) {
        let Some(state) = self.keys.get(key) else {
            return;
        };
        let last_seen = state.last_seen;
        let previous = state.last_usage;
        let reset = marker_changed(
            state.last_marker.as_ref(),
            observation.reset_marker.as_ref(),
            self.config.jitter_tolerance,
        );

        if let Some(last_seen) = last_seen {
            let elapsed = (at - last_seen).to_std().unwrap_or_default();
            if elapsed > self.config.gap_threshold() {
                self.record_anomaly(
                    report,
                    key,
                    at,
                    AnomalyKind::CoverageGap {
                        elapsed_secs: elapsed.as_secs(),
                    },
                );
            }
        }

        if reset {
            self.rollover(key, at, observation, report);
            return;
        }

        let usage = observation.usage;
        if let Some(previous) = previous {
            if usage < previous {
                self.record_anomaly(
                    report,
                    key,
                    at,
                    AnomalyKind::UsageDrop {
                        previous,
                        current: usage,
                    },
                );
            }
        }

        let Some(state) = self.keys.get_mut(key) else {
            return;
        };
        let before = (state.cycle.peak_usage, state.cycle.total_delta);
        match previous {
            Some(previous) if usage >= previous => state.cycle.accumulate(usage - previous, usage),
            Some(_) => {}
            None => state.cycle.accumulate(0.0, usage),
        }
        state.last_usage = Some(usage);
        if observation.reset_marker.is_some() {
            state.last_marker = observation.reset_marker.clone();
        }
        state.last_seen = Some(at);
        if (state.cycle.peak_usage, state.cycle.total_delta) != before {
            state.dirty = true;
        }

        self.sync_store(key, report);
    }

    /// Closes the active cycle for `key` and opens its successor from
    /// `observation`.
    fn rollover(
        &mut self,
        key: &str,
        at: DateTime<Utc>,
        observation: &QuotaObservation,
        report: &mut ProcessReport,
    ) {
        let Some(mut state) = self.keys.remove(key) else {
            return;
        };
        if state.cycle.close(at) {
            let closed = state.cycle;
            tracing::info!(
                provider = %self.provider,
                quota = %key,
                peak = closed.peak_usage,
                total_delta = closed.total_delta,
                "quota reset detected"
            );
            self.sink.on_reset(&self.provider, key, &closed);
            report.resets.push(closed.clone());
            state.unsaved.push(UnsavedClose {
                cycle: closed,
                in_store: state.in_store,
            });
        }
        let next = self.open_cycle(key, at, observation, state.unsaved, report);
        self.keys.insert(key.to_string(), next);
        self.sync_store(key, report);
    }

    /// Brings the store up to date with `key`'s in-memory cycles: pending
    /// closes first, in order, then the active row. Stops at the first
    /// failure and retries from there on the next observation.
    fn sync_store(&mut self, key: &str, report: &mut ProcessReport) {
        let provider = self.provider.as_str();
        let store = &self.store;
        let Some(state) = self.keys.get_mut(key) else {
            return;
        };

        while let Some(pending) = state.unsaved.first_mut() {
            let cycle = &pending.cycle;
            if !pending.in_store {
                if let Err(e) = store.open_cycle(
                    provider,
                    key,
                    cycle.cycle_start,
                    cycle.reset_marker_at_open.as_ref(),
                    cycle.peak_usage,
                ) {
                    push_warning(provider, report, "open_cycle", &e);
                    return;
                }
                pending.in_store = true;
            }
            let cycle_end = cycle.cycle_end.unwrap_or(cycle.cycle_start);
            match store.close_cycle(provider, key, cycle_end, cycle.peak_usage, cycle.total_delta) {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    provider = %provider,
                    quota = %key,
                    "store had no active cycle to close"
                ),
                Err(e) => {
                    push_warning(provider, report, "close_cycle", &e);
                    return;
                }
            }
            state.unsaved.remove(0);
        }

        if !state.in_store {
            let cycle = &state.cycle;
            if let Err(e) = store.open_cycle(
                provider,
                key,
                cycle.cycle_start,
                cycle.reset_marker_at_open.as_ref(),
                cycle.peak_usage,
            ) {
                push_warning(provider, report, "open_cycle", &e);
                return;
            }
            state.in_store = true;
            state.dirty = state.cycle.total_delta > 0.0;
        }

        if state.dirty {
            match store.update_cycle(
                provider,
                key,
                state.cycle.peak_usage,
                state.cycle.total_delta,
            ) {
                Ok(()) => state.dirty = false,
                Err(e) => push_warning(provider, report, "update_cycle", &e),
            }
        }
    }

    /// Closed cycles for `key` that are not yet recorded in the store.
    pub fn unsaved_closes(&self, key: &str) -> usize {
        self.keys.get(key).map_or(0, |state| state.unsaved.len())
    }

    fn record_anomaly(
        &mut self,
        report: &mut ProcessReport,
        key: &str,
        at: DateTime<Utc>,
        kind: AnomalyKind,
    ) {
        match &kind {
            AnomalyKind::UsageDrop { previous, current } => tracing::warn!(
                provider = %self.provider,
                quota = %key,
                previous,
                current,
                "usage dropped without a reset marker change"
            ),
            AnomalyKind::InvalidUsage { value } => tracing::warn!(
                provider = %self.provider,
                quota = %key,
                value,
                "rejected invalid usage value"
            ),
            AnomalyKind::CoverageGap { elapsed_secs } => tracing::info!(
                provider = %self.provider,
                quota = %key,
                elapsed_secs,
                "coverage gap since previous observation"
            ),
        }
        let anomaly = Anomaly {
            provider: self.provider.clone(),
            quota_key: key.to_string(),
            observed_at: at,
            kind,
        };
        if self.config.anomaly_capacity > 0 {
            while self.anomalies.len() >= self.config.anomaly_capacity {
                self.anomalies.pop_front();
            }
            self.anomalies.push_back(anomaly.clone());
        }
        report.anomalies.push(anomaly);
    }

    fn warn(&self, report: &mut ProcessReport, op: &'static str, err: &crate::StoreError) {
        push_warning(&self.provider, report, op, err);
    }

    /// Recent anomalies, oldest first.
    pub fn anomalies(&self) -> impl Iterator<Item = &Anomaly> {
        self.anomalies.iter()
    }

    pub fn active_cycle(&self, key: &str) -> Option<&Cycle> {
        self.keys.get(key).map(|state| &state.cycle)
    }

    pub fn tracked_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn cadence(&self, key: &str) -> Cadence {
        match self.keys.get(key) {
            Some(state) if state.last_marker.is_some() => Cadence::Known,
            _ => Cadence::Unknown,
        }
    }

    /// Summarizes completed and active cycles for `key`.
    ///
    /// Works without any in-memory state for the key (for example from the
    /// CLI) by reading the active cycle from the store.
    pub fn summary(&self, key: &str, now: DateTime<Utc>) -> Result<CycleSummary> {
        let history = self
            .store
            .cycle_history(&self.provider, key, self.config.history_limit)?;

        let (active, current_usage, mut cadence) = match self.keys.get(key) {
            Some(state) => (
                Some(state.cycle.clone()),
                state.last_usage,
                self.cadence(key),
            ),
            None => {
                let active = self.store.active_cycle(&self.provider, key)?;
                let cadence = match &active {
                    Some(cycle) if cycle.reset_marker_at_open.is_some() => Cadence::Known,
                    _ => Cadence::Unknown,
                };
                (active, None, cadence)
            }
        };
        if history.iter().any(|c| c.reset_marker_at_open.is_some()) {
            cadence = Cadence::Known;
        }

        let completed_cycles = history.len();
        let history_delta: f64 = history.iter().map(|c| c.total_delta).sum();
        let avg_delta_per_cycle = if completed_cycles > 0 {
            history_delta / completed_cycles as f64
        } else {
            0.0
        };
        let peak_usage = history
            .iter()
            .chain(active.iter())
            .map(|c| c.peak_usage)
            .fold(0.0, f64::max);
        let total_tracked = history_delta + active.as_ref().map_or(0.0, |c| c.total_delta);
        let tracking_since = history
            .iter()
            .chain(active.iter())
            .map(|c| c.cycle_start)
            .min();
        let current_rate = active.as_ref().and_then(|cycle| rate_per_hour(cycle, now));

        Ok(CycleSummary {
            provider: self.provider.clone(),
            quota_key: key.to_string(),
            completed_cycles,
            avg_delta_per_cycle,
            peak_usage,
            total_tracked,
            tracking_since,
            current_usage,
            cadence,
            current_rate,
            active_cycle: active,
        })
    }
}

/// Absent to present counts as a change; present to absent does not.
fn push_warning(
    provider: &str,
    report: &mut ProcessReport,
    op: &'static str,
    err: &crate::StoreError,
) {
    tracing::warn!(provider = %provider, op, error = %err, "store write failed");
    report.warnings.push(StoreWarning::new(op, err));
}

fn marker_changed(
    previous: Option<&ResetMarker>,
    current: Option<&ResetMarker>,
    tolerance: Duration,
) -> bool {
    match (previous, current) {
        (Some(previous), Some(current)) => previous.differs_from(current, tolerance),
        (None, Some(_)) => true,
        (_, None) => false,
    }
}

fn rate_per_hour(cycle: &Cycle, now: DateTime<Utc>) -> Option<f64> {
    let elapsed = (now - cycle.cycle_start).to_std().ok()?;
    if elapsed < MIN_RATE_WINDOW || cycle.total_delta <= 0.0 {
        return None;
    }
    Some(cycle.total_delta / (elapsed.as_secs_f64() / 3600.0))
}
