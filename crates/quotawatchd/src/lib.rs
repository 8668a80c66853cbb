//! Shared helpers used by the `quotawatchd` binary.

use chrono::{DateTime, Utc};
use qw_config::DaemonConfig;
use qw_quota::{Cadence, Cycle, CycleSummary, Session, SqliteStore};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Build-time daemon version string.
///
/// When `QUOTAWATCHD_VERSION` is provided in the build environment (for
/// example by CI release workflows), that value is used. Otherwise we fall
/// back to the crate package version.
pub const DAEMON_VERSION: &str = match option_env!("QUOTAWATCHD_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

pub const DEFAULT_LOG_FILTER: &str = "quotawatchd=info,qw_agent=info,qw_quota=info";

// ---------------------------------------------------------------------------
// PID file management
// ---------------------------------------------------------------------------

/// Reads the daemon PID from `path`, returning `None` if missing or invalid.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    fs::write(path, std::process::id().to_string())?;
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Returns `true` when a process with `pid` appears to be alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // Safety: signal 0 only checks for existence; nothing is delivered.
        unsafe { libc::kill(raw, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Returns the PID of another live daemon recorded at `path`, cleaning up
/// stale files along the way.
pub fn running_daemon(path: &Path) -> Option<u32> {
    let pid = read_pid_file(path)?;
    if pid != std::process::id() && is_process_alive(pid) {
        return Some(pid);
    }
    tracing::warn!("Removing stale PID file for dead process {}", pid);
    remove_pid_file(path);
    None
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Opens the SQLite store named by `config`, creating its directory.
pub fn open_store(config: &DaemonConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let path = config.database_path()?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let store = SqliteStore::open(&path)?;
    tracing::debug!(path = %path.display(), "opened quota store");
    Ok(Arc::new(store))
}

// ---------------------------------------------------------------------------
// Report formatting
// ---------------------------------------------------------------------------

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Renders a duration as `1d 2h`, `3h 4m`, `5m` or `42s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3_600, (secs % 3_600) / 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{secs}s")
    }
}

fn span(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format_duration((end - start).to_std().unwrap_or_default())
}

pub fn format_cycles(active: Option<&Cycle>, history: &[Cycle]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<20} {:>10} {:>12} {:>12}",
        "START", "END", "LENGTH", "PEAK", "DELTA"
    );
    for cycle in active.into_iter().chain(history) {
        let (end, length) = match cycle.cycle_end {
            Some(end) => (format_timestamp(end), span(cycle.cycle_start, end)),
            None => ("(active)".to_string(), span(cycle.cycle_start, Utc::now())),
        };
        let _ = writeln!(
            out,
            "{:<20} {:<20} {:>10} {:>12.2} {:>12.2}",
            format_timestamp(cycle.cycle_start),
            end,
            length,
            cycle.peak_usage,
            cycle.total_delta
        );
    }
    out
}

pub fn format_sessions(sessions: &[Session]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<36} {:<20} {:>10} {:>6}  MAX USAGE",
        "ID", "STARTED", "LENGTH", "POLLS"
    );
    for session in sessions {
        let length = match session.ended_at {
            Some(end) => span(session.started_at, end),
            None => "(open)".to_string(),
        };
        let maxima = session
            .max_usage
            .iter()
            .map(|(key, value)| format!("{key}={value:.2}"))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(
            out,
            "{:<36} {:<20} {:>10} {:>6}  {}",
            session.id,
            format_timestamp(session.started_at),
            length,
            session.snapshot_count,
            maxima
        );
    }
    out
}

pub fn format_summary(summary: &CycleSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} / {}", summary.provider, summary.quota_key);
    let cadence = match summary.cadence {
        Cadence::Known => "known",
        Cadence::Unknown => "unknown (no reset marker)",
    };
    let _ = writeln!(out, "  reset cadence:     {cadence}");
    let _ = writeln!(out, "  completed cycles:  {}", summary.completed_cycles);
    let _ = writeln!(out, "  avg per cycle:     {:.2}", summary.avg_delta_per_cycle);
    let _ = writeln!(out, "  highest peak:      {:.2}", summary.peak_usage);
    let _ = writeln!(out, "  total tracked:     {:.2}", summary.total_tracked);
    if let Some(since) = summary.tracking_since {
        let _ = writeln!(out, "  tracking since:    {}", format_timestamp(since));
    }
    match &summary.active_cycle {
        Some(cycle) => {
            let _ = writeln!(
                out,
                "  active cycle:      since {} (peak {:.2}, delta {:.2})",
                format_timestamp(cycle.cycle_start),
                cycle.peak_usage,
                cycle.total_delta
            );
        }
        None => {
            let _ = writeln!(out, "  active cycle:      none");
        }
    }
    match summary.current_rate {
        Some(rate) => {
            let _ = writeln!(out, "  current rate:      {rate:.2}/h");
        }
        None => {
            let _ = writeln!(out, "  current rate:      n/a");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use qw_config::ConfigPaths;
    use std::collections::BTreeMap;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600 + secs, 0).single().unwrap()
    }

    fn session(started: i64, ended: Option<i64>) -> Session {
        let mut session = Session::open(
            Default::default(),
            "codex",
            at(started),
            Duration::from_secs(600),
        );
        session.ended_at = ended.map(at);
        session.snapshot_count = 12;
        session.max_usage = BTreeMap::from([("primary".to_string(), 41.5)]);
        session
    }

    // -- PID file management -----------------------------------------------

    #[test]
    fn read_pid_file_handles_whitespace_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        fs::write(&path, "  42  \n").unwrap();
        assert_eq!(read_pid_file(&path), Some(42));
        fs::write(&path, "not-a-number").unwrap();
        assert_eq!(read_pid_file(&path), None);
        fs::write(&path, "-1").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[test]
    fn write_read_remove_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        assert_eq!(read_pid_file(&path), None);
        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path), Some(std::process::id()));
        remove_pid_file(&path);
        assert_eq!(read_pid_file(&path), None);
        remove_pid_file(&path);
    }

    #[test]
    fn is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn is_process_alive_out_of_range_pid() {
        assert!(!is_process_alive(4_000_000_000));
    }

    #[test]
    fn running_daemon_ignores_own_pid_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quotawatchd.pid");
        write_pid_file(&path).unwrap();
        assert_eq!(running_daemon(&path), None);
        assert!(!path.exists());
    }

    // -- store ---------------------------------------------------------------

    #[test]
    fn open_store_creates_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.set_paths(ConfigPaths::with_base(dir.path().join("nested")));
        let _store = open_store(&config).unwrap();
        assert!(dir.path().join("nested").join("quotawatch.db").exists());
    }

    // -- formatting ----------------------------------------------------------

    #[test]
    fn format_duration_picks_largest_units() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(3_660)), "1h 1m");
        assert_eq!(format_duration(Duration::from_secs(5 * 3_600)), "5h 0m");
        assert_eq!(format_duration(Duration::from_secs(90_000)), "1d 1h");
    }

    #[test]
    fn format_cycles_lists_active_first() {
        let mut closed = Cycle::open("codex", "primary", at(0), None, 10.0);
        closed.total_delta = 30.0;
        closed.peak_usage = 40.0;
        closed.cycle_end = Some(at(18_000));
        let active = Cycle::open("codex", "primary", at(18_000), None, 2.0);

        let out = format_cycles(Some(&active), &[closed]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("START"));
        assert!(lines[1].contains("(active)"));
        assert!(lines[2].contains("2026-01-01 05:00:00"));
        assert!(lines[2].contains("5h 0m"));
        assert!(lines[2].contains("40.00"));
    }

    #[test]
    fn format_sessions_shows_open_and_closed() {
        let out = format_sessions(&[session(600, None), session(0, Some(300))]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("(open)"));
        assert!(lines[2].contains("5m"));
        assert!(lines[2].contains("primary=41.50"));
    }

    #[test]
    fn format_summary_marks_unknown_cadence() {
        let summary = CycleSummary {
            provider: "codex".into(),
            quota_key: "seven_day".into(),
            completed_cycles: 0,
            avg_delta_per_cycle: 0.0,
            peak_usage: 19.0,
            total_tracked: 9.0,
            tracking_since: Some(at(0)),
            current_usage: Some(19.0),
            cadence: Cadence::Unknown,
            current_rate: None,
            active_cycle: None,
        };
        let out = format_summary(&summary);
        assert!(out.contains("unknown (no reset marker)"));
        assert!(out.contains("current rate:      n/a"));
        assert!(out.contains("highest peak:      19.00"));
    }
}
