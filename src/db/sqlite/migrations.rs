//! SQLite database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Run all database migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // Create migrations table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    run_migration(conn, "001_job_definitions", CREATE_JOB_DEFINITIONS_TABLE)?;
    run_migration(conn, "002_job_runs", CREATE_JOB_RUNS_TABLE)?;
    run_migration(conn, "003_coverage_status", CREATE_COVERAGE_STATUS_TABLE)?;
    run_migration(conn, "004_definition_leases", CREATE_DEFINITION_LEASES_TABLE)?;
    run_migration(conn, "005_settings", CREATE_SETTINGS_TABLE)?;
    run_migration(conn, "006_job_type_policies", CREATE_JOB_TYPE_POLICIES_TABLE)?;
    run_migration(conn, "007_provider_routes", CREATE_PROVIDER_ROUTES_TABLE)?;
    run_migration(conn, "008_market_timings", CREATE_MARKET_TIMINGS_TABLE)?;
    run_migration(conn, "009_market_holidays", CREATE_MARKET_HOLIDAYS_TABLE)?;

    tracing::info!("Database migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    // Check if migration already applied
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?)",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

const CREATE_JOB_DEFINITIONS_TABLE: &str = r#"
CREATE TABLE job_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    window_days INTEGER NOT NULL,
    slice_hours INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (symbol, timeframe, job_type)
);

CREATE INDEX idx_job_definitions_schedule ON job_definitions(enabled, priority DESC, created_at);
"#;

const CREATE_JOB_RUNS_TABLE: &str = r#"
CREATE TABLE job_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_definition_id INTEGER NOT NULL REFERENCES job_definitions(id),
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    job_type TEXT NOT NULL,
    slice_start TEXT NOT NULL,
    slice_end TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'success', 'failed')),
    attempt INTEGER NOT NULL DEFAULT 1,
    max_attempts INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    triggered_by TEXT NOT NULL DEFAULT 'tick',
    provider TEXT,
    rows_written INTEGER NOT NULL DEFAULT 0,
    progress_percent REAL NOT NULL DEFAULT 0,
    error_code TEXT,
    error_message TEXT,
    next_eligible_at TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    updated_at TEXT NOT NULL,
    CHECK (slice_start <= slice_end),
    CHECK (attempt <= max_attempts)
);

CREATE INDEX idx_job_runs_pair_status ON job_runs(symbol, timeframe, status);
CREATE INDEX idx_job_runs_dispatch ON job_runs(status, priority DESC, created_at);
CREATE INDEX idx_job_runs_created ON job_runs(created_at);
"#;

const CREATE_COVERAGE_STATUS_TABLE: &str = r#"
CREATE TABLE coverage_status (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    from_ts TEXT,
    to_ts TEXT,
    last_success_at TEXT,
    last_rows_written INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (symbol, timeframe),
    CHECK (from_ts IS NULL OR to_ts IS NULL OR from_ts <= to_ts)
);
"#;

const CREATE_DEFINITION_LEASES_TABLE: &str = r#"
CREATE TABLE definition_leases (
    job_definition_id INTEGER PRIMARY KEY REFERENCES job_definitions(id),
    holder_id TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

const CREATE_SETTINGS_TABLE: &str = r#"
CREATE TABLE settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    max_concurrent_jobs INTEGER NOT NULL DEFAULT 4,
    tick_interval_secs INTEGER NOT NULL DEFAULT 60,
    lease_ttl_secs INTEGER NOT NULL DEFAULT 120,
    ensure_priority_boost INTEGER NOT NULL DEFAULT 100,
    backoff_jitter_pct REAL NOT NULL DEFAULT 0.2,
    scheduler_enabled INTEGER NOT NULL DEFAULT 1,
    api_enabled INTEGER NOT NULL DEFAULT 1,
    api_host TEXT NOT NULL DEFAULT '127.0.0.1',
    api_port INTEGER NOT NULL DEFAULT 5780,
    calendar_exchange TEXT NOT NULL DEFAULT 'US',
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

INSERT INTO settings (id) VALUES (1);
"#;

const CREATE_JOB_TYPE_POLICIES_TABLE: &str = r#"
CREATE TABLE job_type_policies (
    job_type TEXT PRIMARY KEY,
    max_slice_hours INTEGER NOT NULL,
    max_slices_per_tick INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    backoff_base_secs INTEGER NOT NULL,
    backoff_max_secs INTEGER NOT NULL,
    run_timeout_secs INTEGER NOT NULL
);

INSERT INTO job_type_policies VALUES ('fetch_intraday', 24, 10, 3, 30, 900, 600);
INSERT INTO job_type_policies VALUES ('fetch_historical', 720, 5, 5, 60, 3600, 1800);
"#;

const CREATE_PROVIDER_ROUTES_TABLE: &str = r#"
CREATE TABLE provider_routes (
    job_type TEXT PRIMARY KEY,
    provider_name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    rate_per_second INTEGER NOT NULL DEFAULT 5,
    max_bars_per_request INTEGER NOT NULL DEFAULT 1000,
    timeout_secs INTEGER NOT NULL DEFAULT 30
);
"#;

const CREATE_MARKET_TIMINGS_TABLE: &str = r#"
CREATE TABLE market_timings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL UNIQUE,
    timezone TEXT NOT NULL,
    market_open TEXT NOT NULL,
    market_close TEXT NOT NULL
);

INSERT INTO market_timings (exchange, timezone, market_open, market_close)
VALUES ('US', 'America/New_York', '09:30', '16:00');
"#;

const CREATE_MARKET_HOLIDAYS_TABLE: &str = r#"
CREATE TABLE market_holidays (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    date TEXT NOT NULL,
    description TEXT,
    UNIQUE (exchange, date)
);

INSERT INTO market_holidays (exchange, date, description) VALUES
    ('US', '2026-01-01', 'New Year''s Day'),
    ('US', '2026-01-19', 'Martin Luther King Jr. Day'),
    ('US', '2026-02-16', 'Washington''s Birthday'),
    ('US', '2026-04-03', 'Good Friday'),
    ('US', '2026-05-25', 'Memorial Day'),
    ('US', '2026-06-19', 'Juneteenth'),
    ('US', '2026-07-03', 'Independence Day (observed)'),
    ('US', '2026-09-07', 'Labor Day'),
    ('US', '2026-11-26', 'Thanksgiving Day'),
    ('US', '2026-12-25', 'Christmas Day');
"#;
