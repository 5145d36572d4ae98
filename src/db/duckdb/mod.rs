//! DuckDB database module for OHLCV bars

pub mod models;
mod migrations;

use crate::error::Result;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use models::{BarRow, BarSummary};
use parking_lot::Mutex;
use std::path::Path;

/// DuckDB database wrapper
pub struct DuckDb {
    conn: Mutex<Connection>,
}

fn ts_from_secs(secs: i64) -> duckdb::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            0,
            duckdb::types::Type::BigInt,
            format!("timestamp out of range: {}", secs).into(),
        )
    })
}

impl DuckDb {
    /// Create new DuckDB connection
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        // Run migrations
        db.run_migrations()?;

        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();
        migrations::run_migrations(&conn)
    }

    /// Query bars for a pair over `[from, to]`, across all providers
    pub fn query_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BarRow>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT ts, open, high, low, close, volume
             FROM bars
             WHERE symbol = ? AND timeframe = ? AND ts >= ? AND ts <= ?
             ORDER BY ts ASC, provider ASC",
        )?;

        let rows = stmt
            .query_map(
                duckdb::params![symbol, timeframe, from.timestamp(), to.timestamp()],
                |row| {
                    Ok(BarRow {
                        ts: ts_from_secs(row.get(0)?)?,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Upsert bars keyed on (symbol, timeframe, ts, provider).
    ///
    /// Re-fetching a range overwrites values in place, so a retried slice
    /// never produces duplicate rows.
    pub fn upsert_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        provider: &str,
        data: &[BarRow],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();

        let tx = conn.transaction()?;

        let mut stmt = tx.prepare(
            "INSERT INTO bars (symbol, timeframe, ts, open, high, low, close, volume, provider)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (symbol, timeframe, ts, provider) DO UPDATE SET
               open = excluded.open, high = excluded.high, low = excluded.low,
               close = excluded.close, volume = excluded.volume",
        )?;

        let mut count = 0;
        for row in data {
            stmt.execute(duckdb::params![
                symbol,
                timeframe,
                row.ts.timestamp(),
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume,
                provider,
            ])?;
            count += 1;
        }

        drop(stmt);
        tx.commit()?;

        Ok(count)
    }

    /// Number of stored bars for a pair, all providers
    pub fn count_bars(&self, symbol: &str, timeframe: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bars WHERE symbol = ? AND timeframe = ?",
            duckdb::params![symbol, timeframe],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Count and span per provider for a pair
    pub fn summarize(&self, symbol: &str, timeframe: &str) -> Result<Vec<BarSummary>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT provider, COUNT(*), MIN(ts), MAX(ts)
             FROM bars WHERE symbol = ? AND timeframe = ?
             GROUP BY provider ORDER BY provider",
        )?;

        let rows = stmt
            .query_map(duckdb::params![symbol, timeframe], |row| {
                let first: Option<i64> = row.get(2)?;
                let last: Option<i64> = row.get(3)?;
                Ok(BarSummary {
                    provider: row.get(0)?,
                    bar_count: row.get(1)?,
                    first_ts: first.map(ts_from_secs).transpose()?,
                    last_ts: last.map(ts_from_secs).transpose()?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}
