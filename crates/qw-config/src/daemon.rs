use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::ConfigPaths;
use crate::provider::ProviderConfig;
use crate::tracking::TrackingConfig;
use qw_quota::TrackerConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Overrides `~/.quotawatch/quotawatch.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(skip)]
    paths: Option<ConfigPaths>,
}

impl DaemonConfig {
    /// Returns the `ConfigPaths` for this config. If paths haven't been set,
    /// creates the default paths (may fail if `$HOME` is unset).
    pub fn paths(&self) -> anyhow::Result<ConfigPaths> {
        match &self.paths {
            Some(p) => Ok(p.clone()),
            None => ConfigPaths::new(),
        }
    }

    pub fn set_paths(&mut self, paths: ConfigPaths) {
        self.paths = Some(paths);
    }

    /// Load config from the default location (`~/.quotawatch/config.toml`).
    pub fn load() -> anyhow::Result<Self> {
        let paths = ConfigPaths::new()?;
        Self::load_from(&paths)
    }

    /// Load config from a specific `ConfigPaths`, then apply environment
    /// overrides and validate.
    pub fn load_from(paths: &ConfigPaths) -> anyhow::Result<Self> {
        let config_file = paths.config_path();
        let mut config = if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            config
        } else {
            Self::default()
        };
        config.paths = Some(paths.clone());
        config
            .tracking
            .apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config values. Called automatically by `load` / `load_from`.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.tracking.validate()?;
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                anyhow::bail!("provider name must not be empty");
            }
            if !seen.insert(provider.name.as_str()) {
                anyhow::bail!("duplicate provider name: {}", provider.name);
            }
            if provider.url.trim().is_empty() {
                anyhow::bail!("provider {} must have a url", provider.name);
            }
            if provider.poll_interval_secs == Some(0) {
                anyhow::bail!("provider {} poll_interval_secs must be greater than 0", provider.name);
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.paths()?.db_path()),
        }
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    pub fn poll_interval_for(&self, provider: &ProviderConfig) -> Duration {
        provider
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.tracking.poll_interval())
    }

    pub fn tracker_config_for(&self, provider: &ProviderConfig) -> TrackerConfig {
        self.tracking.tracker_config(self.poll_interval_for(provider))
    }
}
