//! DuckDB migrations

use crate::error::Result;
use duckdb::Connection;

/// Run all DuckDB migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // name is the primary key; no auto-increment needed
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            name VARCHAR PRIMARY KEY,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )?;

    run_migration(conn, "001_bars", CREATE_BARS)?;

    tracing::info!("DuckDB migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM migrations WHERE name = ?",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running DuckDB migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

// ts is the bar open time in unix seconds
const CREATE_BARS: &str = r#"
CREATE TABLE IF NOT EXISTS bars (
    symbol VARCHAR NOT NULL,
    timeframe VARCHAR NOT NULL,
    ts BIGINT NOT NULL,
    open DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    close DOUBLE NOT NULL,
    volume DOUBLE NOT NULL,
    provider VARCHAR NOT NULL,
    PRIMARY KEY (symbol, timeframe, ts, provider)
);
"#;
