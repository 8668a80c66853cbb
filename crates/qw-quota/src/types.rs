use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Provider-supplied value whose change marks the start of a new billing
/// period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMarker {
    Timestamp(DateTime<Utc>),
    Token(String),
}

impl ResetMarker {
    /// Returns `true` when `other` names a different billing period.
    ///
    /// Timestamps closer than `tolerance` are the same period; tokens must be
    /// byte-equal. Markers of different kinds never match.
    pub fn differs_from(&self, other: &ResetMarker, tolerance: Duration) -> bool {
        match (self, other) {
            (ResetMarker::Timestamp(a), ResetMarker::Timestamp(b)) => {
                let diff = if a >= b { *a - *b } else { *b - *a };
                match diff.to_std() {
                    Ok(diff) => diff >= tolerance,
                    Err(_) => true,
                }
            }
            (ResetMarker::Token(a), ResetMarker::Token(b)) => a != b,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaObservation {
    pub usage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_marker: Option<ResetMarker>,
}

impl QuotaObservation {
    pub fn new(usage: f64) -> Self {
        Self {
            usage,
            budget: None,
            reset_marker: None,
        }
    }

    pub fn with_marker(mut self, marker: ResetMarker) -> Self {
        self.reset_marker = Some(marker);
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Usage values the tracker can reason about: finite and non-negative.
    pub fn has_valid_usage(&self) -> bool {
        self.usage.is_finite() && self.usage >= 0.0
    }
}

/// One timestamped observation of every quota a provider exposes.
///
/// Quota keys are discovered at runtime, so they live in a map rather than
/// in fixed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub provider: String,
    pub captured_at: DateTime<Utc>,
    pub quotas: BTreeMap<String, QuotaObservation>,
}

impl Snapshot {
    pub fn new(provider: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            provider: provider.into(),
            captured_at,
            quotas: BTreeMap::new(),
        }
    }

    pub fn with_quota(mut self, key: impl Into<String>, observation: QuotaObservation) -> Self {
        self.quotas.insert(key.into(), observation);
        self
    }
}

/// Bookkeeping for one billing period of one `(provider, quota_key)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cycle {
    pub provider: String,
    pub quota_key: String,
    pub cycle_start: DateTime<Utc>,
    pub cycle_end: Option<DateTime<Utc>>,
    pub reset_marker_at_open: Option<ResetMarker>,
    pub peak_usage: f64,
    pub total_delta: f64,
}

impl Cycle {
    pub fn open(
        provider: impl Into<String>,
        quota_key: impl Into<String>,
        cycle_start: DateTime<Utc>,
        reset_marker: Option<ResetMarker>,
        initial_usage: f64,
    ) -> Self {
        Self {
            provider: provider.into(),
            quota_key: quota_key.into(),
            cycle_start,
            cycle_end: None,
            reset_marker_at_open: reset_marker,
            peak_usage: initial_usage,
            total_delta: 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.cycle_end.is_none()
    }

    /// Adds a usage increase to the cycle. Negative or non-finite amounts
    /// are ignored so `total_delta` never decreases.
    pub fn accumulate(&mut self, delta: f64, usage: f64) {
        if delta.is_finite() && delta > 0.0 {
            self.total_delta += delta;
        }
        if usage > self.peak_usage {
            self.peak_usage = usage;
        }
    }

    /// Sets `cycle_end`. Closing twice is a programmer error.
    pub fn close(&mut self, cycle_end: DateTime<Utc>) -> bool {
        if let Some(existing) = self.cycle_end {
            debug_assert!(
                false,
                "cycle {}/{} closed twice (already ended at {existing})",
                self.provider, self.quota_key
            );
            tracing::error!(
                provider = %self.provider,
                quota = %self.quota_key,
                ended_at = %existing,
                "ignoring second close of an already-closed cycle"
            );
            return false;
        }
        self.cycle_end = Some(cycle_end);
        true
    }
}

/// A usage-bounded grouping of snapshots for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub idle_timeout: Duration,
    pub max_usage: BTreeMap<String, f64>,
    pub snapshot_count: u64,
}

impl Session {
    pub fn open(
        id: Uuid,
        provider: impl Into<String>,
        started_at: DateTime<Utc>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            id,
            provider: provider.into(),
            started_at,
            ended_at: None,
            idle_timeout,
            max_usage: BTreeMap::new(),
            snapshot_count: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Folds observed usage into the running maxima and counts the snapshot.
    /// Returns the keys whose maximum was raised.
    pub fn record(
        &mut self,
        usage: &BTreeMap<String, f64>,
    ) -> Result<BTreeMap<String, f64>, crate::SessionError> {
        if !self.is_open() {
            return Err(crate::SessionError::Closed(self.id));
        }
        self.snapshot_count += 1;
        Ok(merge_max_usage(&mut self.max_usage, usage))
    }

    /// Sets `ended_at`. Closing twice is a programmer error.
    pub fn close(&mut self, ended_at: DateTime<Utc>) -> bool {
        if let Some(existing) = self.ended_at {
            debug_assert!(
                false,
                "session {} closed twice (already ended at {existing})",
                self.id
            );
            tracing::error!(
                session_id = %self.id,
                ended_at = %existing,
                "ignoring second close of an already-closed session"
            );
            return false;
        }
        self.ended_at = Some(ended_at);
        true
    }
}

/// Raises `target[k]` to `update[k]` where larger (missing keys count as 0)
/// and returns the entries that changed.
pub(crate) fn merge_max_usage(
    target: &mut BTreeMap<String, f64>,
    update: &BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    let mut raised = BTreeMap::new();
    for (key, &value) in update {
        if !value.is_finite() || value < 0.0 {
            continue;
        }
        let current = target.entry(key.clone()).or_insert(0.0);
        if value > *current {
            *current = value;
            raised.insert(key.clone(), value);
        }
    }
    raised
}
