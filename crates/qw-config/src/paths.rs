use std::path::PathBuf;

/// Overrides the `~/.quotawatch` state directory.
pub const HOME_ENV: &str = "QUOTAWATCH_HOME";

const CONFIG_FILE: &str = "config.toml";
const DB_FILE: &str = "quotawatch.db";
const PID_FILE: &str = "quotawatchd.pid";

/// Where the daemon keeps its config, database and PID file.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    base: PathBuf,
}

impl ConfigPaths {
    /// `$QUOTAWATCH_HOME`, falling back to `~/.quotawatch`.
    pub fn new() -> anyhow::Result<Self> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    fn resolve<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup(HOME_ENV).filter(|value| !value.trim().is_empty()) {
            return Ok(Self::with_base(PathBuf::from(base)));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(Self::with_base(home.join(".quotawatch")))
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.base.join(DB_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.base.join(PID_FILE)
    }

    pub fn ensure_config_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_env_overrides_default_base() {
        let paths = ConfigPaths::resolve(|name| {
            (name == HOME_ENV).then(|| "/srv/quotawatch".to_string())
        })
        .unwrap();
        assert_eq!(paths.db_path(), PathBuf::from("/srv/quotawatch/quotawatch.db"));
        assert_eq!(paths.pid_path(), PathBuf::from("/srv/quotawatch/quotawatchd.pid"));
    }

    #[test]
    fn blank_home_env_is_ignored() {
        let paths = ConfigPaths::resolve(|_| Some("  ".to_string())).unwrap();
        assert!(paths.config_path().ends_with(".quotawatch/config.toml"));
    }

    #[test]
    fn ensure_config_dir_creates_nested_base() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_base(dir.path().join("state").join("qw"));
        paths.ensure_config_dir().unwrap();
        paths.ensure_config_dir().unwrap();
        assert!(dir.path().join("state").join("qw").is_dir());
    }
}
