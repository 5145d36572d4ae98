//! Job run statistics
//!
//! Aggregates over the run ledger for the operator status query.

use super::connection::ts_to_sql;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Run counts and throughput over a time window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub total_runs: i64,
    pub queued: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub failed_exhausted: i64,
    pub total_rows_written: i64,
    pub avg_duration_secs: f64,
    pub provider_stats: HashMap<String, ProviderStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStats {
    pub finished_runs: i64,
    pub failed_runs: i64,
    pub success_rate: f64,
    pub rows_written: i64,
}

/// Stats over runs created at or after `since`, optionally narrowed
pub fn get_stats(
    conn: &Connection,
    since: DateTime<Utc>,
    symbol: Option<&str>,
    timeframe: Option<&str>,
) -> Result<JobStats> {
    let since_sql = ts_to_sql(&since);
    let mut stats = JobStats::default();

    {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*),
                    SUM(CASE WHEN status = 'failed' AND attempt >= max_attempts THEN 1 ELSE 0 END),
                    COALESCE(SUM(rows_written), 0)
             FROM job_runs
             WHERE created_at >= ?1
               AND (?2 IS NULL OR symbol = ?2) AND (?3 IS NULL OR timeframe = ?3)
             GROUP BY status",
        )?;
        let rows = stmt.query_map(params![since_sql, symbol, timeframe], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        for row in rows {
            let (status, count, exhausted, rows_written) = row?;
            stats.total_runs += count;
            stats.total_rows_written += rows_written;
            match status.as_str() {
                "queued" => stats.queued = count,
                "running" => stats.running = count,
                "success" => stats.success = count,
                "failed" => {
                    stats.failed = count;
                    stats.failed_exhausted = exhausted;
                }
                _ => {}
            }
        }
    }

    // julianday handles the RFC 3339 text directly
    stats.avg_duration_secs = conn.query_row(
        "SELECT COALESCE(AVG((julianday(finished_at) - julianday(started_at)) * 86400.0), 0)
         FROM job_runs
         WHERE created_at >= ?1 AND started_at IS NOT NULL AND finished_at IS NOT NULL
           AND status IN ('success', 'failed')
           AND (?2 IS NULL OR symbol = ?2) AND (?3 IS NULL OR timeframe = ?3)",
        params![since_sql, symbol, timeframe],
        |row| row.get(0),
    )?;

    {
        let mut stmt = conn.prepare(
            "SELECT provider, COUNT(*),
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                    COALESCE(SUM(rows_written), 0)
             FROM job_runs
             WHERE created_at >= ?1 AND provider IS NOT NULL
               AND status IN ('success', 'failed')
               AND (?2 IS NULL OR symbol = ?2) AND (?3 IS NULL OR timeframe = ?3)
             GROUP BY provider",
        )?;
        let rows = stmt.query_map(params![since_sql, symbol, timeframe], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        for row in rows {
            let (provider, finished, failed, rows_written) = row?;
            let success_rate = if finished > 0 {
                ((finished - failed) as f64 / finished as f64) * 100.0
            } else {
                0.0
            };
            stats.provider_stats.insert(
                provider,
                ProviderStats {
                    finished_runs: finished,
                    failed_runs: failed,
                    success_rate,
                    rows_written,
                },
            );
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::connection::create_memory_connection;
    use crate::db::sqlite::migrations::run_migrations;
    use chrono::{Duration, TimeZone};

    fn insert_run(conn: &Connection, status: &str, attempt: i64, provider: Option<&str>, rows: i64, created: &str) {
        conn.execute(
            "INSERT INTO job_runs
                (job_definition_id, symbol, timeframe, job_type, slice_start, slice_end, status,
                 attempt, max_attempts, provider, rows_written, created_at, started_at, finished_at, updated_at)
             VALUES (1, 'AAPL', '1h', 'fetch_intraday', '2026-10-14T13:00:00.000Z', '2026-10-14T19:00:00.000Z',
                     ?1, ?2, 3, ?3, ?4, ?5,
                     '2026-10-15T10:00:00.000Z', '2026-10-15T10:00:04.000Z', ?5)",
            params![status, attempt, provider, rows, created],
        )
        .unwrap();
    }

    #[test]
    fn test_stats_by_status_and_provider() {
        let conn = create_memory_connection().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO job_definitions
                (id, job_type, symbol, timeframe, window_days, slice_hours, created_at, updated_at)
             VALUES (1, 'fetch_intraday', 'AAPL', '1h', 7, 24, 'x', 'x')",
            [],
        )
        .unwrap();

        let created = "2026-10-15T10:00:00.000Z";
        insert_run(&conn, "success", 1, Some("alpha"), 7, created);
        insert_run(&conn, "success", 1, Some("alpha"), 7, created);
        insert_run(&conn, "failed", 1, Some("alpha"), 0, created);
        insert_run(&conn, "failed", 3, Some("beta"), 2, created);
        // Outside the window
        insert_run(&conn, "success", 1, Some("beta"), 100, "2026-10-01T10:00:00.000Z");

        let since = Utc.with_ymd_and_hms(2026, 10, 15, 11, 0, 0).unwrap() - Duration::hours(24);
        let stats = get_stats(&conn, since, None, None).unwrap();

        assert_eq!(stats.total_runs, 4);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.failed_exhausted, 1);
        assert_eq!(stats.total_rows_written, 16);
        assert!((stats.avg_duration_secs - 4.0).abs() < 0.01);

        let alpha = &stats.provider_stats["alpha"];
        assert_eq!(alpha.finished_runs, 3);
        assert!((alpha.success_rate - 66.666).abs() < 0.1);
        assert_eq!(stats.provider_stats["beta"].success_rate, 0.0);
    }
}
