use qw_quota::{AccountantConfig, TrackerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const POLL_INTERVAL_ENV: &str = "QUOTAWATCH_POLL_INTERVAL";

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_jitter_tolerance_ms() -> u64 {
    5_000
}

fn default_gap_multiplier() -> f64 {
    3.0
}

fn default_history_limit() -> usize {
    50
}

fn default_anomaly_capacity() -> usize {
    64
}

/// Constants threaded into every tracker and accountant at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_jitter_tolerance_ms")]
    pub jitter_tolerance_ms: u64,
    /// A gap longer than `poll_interval * gap_multiplier` is logged.
    #[serde(default = "default_gap_multiplier")]
    pub gap_multiplier: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_anomaly_capacity")]
    pub anomaly_capacity: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            jitter_tolerance_ms: default_jitter_tolerance_ms(),
            gap_multiplier: default_gap_multiplier(),
            history_limit: default_history_limit(),
            anomaly_capacity: default_anomaly_capacity(),
        }
    }
}

impl TrackingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn tracker_config(&self, poll_interval: Duration) -> TrackerConfig {
        TrackerConfig {
            jitter_tolerance: Duration::from_millis(self.jitter_tolerance_ms),
            poll_interval,
            gap_multiplier: self.gap_multiplier,
            history_limit: self.history_limit,
            anomaly_capacity: self.anomaly_capacity,
        }
    }

    pub fn accountant_config(&self) -> AccountantConfig {
        AccountantConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }

    /// Applies `QUOTAWATCH_POLL_INTERVAL` (seconds) when set. `lookup` is
    /// the environment in production and a closure in tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(POLL_INTERVAL_ENV) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                anyhow::anyhow!("{POLL_INTERVAL_ENV} must be a whole number of seconds, got {raw:?}")
            })?;
            self.poll_interval_secs = secs;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("tracking.poll_interval_secs must be greater than 0");
        }
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("tracking.idle_timeout_secs must be greater than 0");
        }
        if !(self.gap_multiplier >= 1.0) {
            anyhow::bail!("tracking.gap_multiplier must be at least 1");
        }
        if self.history_limit == 0 {
            anyhow::bail!("tracking.history_limit must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_convert_into_core_configs() {
        let tracking = TrackingConfig::default();
        let tracker = tracking.tracker_config(tracking.poll_interval());
        assert_eq!(tracker.jitter_tolerance, Duration::from_secs(5));
        assert_eq!(tracker.poll_interval, Duration::from_secs(60));
        assert_eq!(tracker.history_limit, 50);
        assert_eq!(
            tracking.accountant_config().idle_timeout,
            Duration::from_secs(600)
        );
    }

    #[test]
    fn env_override_replaces_poll_interval() {
        let mut tracking = TrackingConfig::default();
        tracking
            .apply_env_overrides(|name| (name == POLL_INTERVAL_ENV).then(|| "15".to_string()))
            .unwrap();
        assert_eq!(tracking.poll_interval_secs, 15);
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut tracking = TrackingConfig::default();
        let result = tracking.apply_env_overrides(|_| Some("soon".to_string()));
        assert!(result.is_err());
        assert_eq!(tracking.poll_interval_secs, 60);
    }

    #[test]
    fn validate_rejects_small_gap_multiplier() {
        let mut tracking = TrackingConfig::default();
        tracking.gap_multiplier = 0.5;
        assert!(tracking.validate().is_err());
        tracking.gap_multiplier = f64::NAN;
        assert!(tracking.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut tracking = TrackingConfig::default();
        tracking.idle_timeout_secs = 0;
        assert!(tracking.validate().is_err());

        let mut tracking = TrackingConfig::default();
        tracking.poll_interval_secs = 0;
        assert!(tracking.validate().is_err());
    }
}
