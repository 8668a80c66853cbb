use rusqlite::Connection;

struct Migration {
    version: u32,
    up_sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                quotas_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_provider_captured
                ON snapshots(provider, captured_at);

            CREATE TABLE IF NOT EXISTS cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                quota_key TEXT NOT NULL,
                cycle_start TEXT NOT NULL,
                cycle_end TEXT,
                reset_marker_json TEXT,
                peak_usage REAL NOT NULL DEFAULT 0,
                total_delta REAL NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_cycles_key_start
                ON cycles(provider, quota_key, cycle_start);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_cycles_one_active
                ON cycles(provider, quota_key) WHERE cycle_end IS NULL;
        "#,
    },
    Migration {
        version: 2,
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                idle_timeout_secs INTEGER NOT NULL,
                max_usage_json TEXT NOT NULL DEFAULT '{}',
                snapshot_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_provider_started
                ON sessions(provider, started_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_open
                ON sessions(provider) WHERE ended_at IS NULL;
        "#,
    },
];

pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);")?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!("Running migration v{}", migration.version);
            conn.execute_batch(migration.up_sql)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as u32);
    }

    #[test]
    fn second_active_cycle_is_rejected_by_index() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let insert = "INSERT INTO cycles (provider, quota_key, cycle_start) VALUES ('p', 'k', '2026-01-01T00:00:00.000Z')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
