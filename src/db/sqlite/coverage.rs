//! Coverage status persistence

use super::connection::{get_opt_ts, get_ts, ts_to_sql};
use super::job_definitions::conversion_error;
use crate::db::sqlite::models::CoverageStatus;
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const SELECT_COLUMNS: &str =
    "symbol, timeframe, from_ts, to_ts, last_success_at, last_rows_written, updated_at";

fn map_row(row: &Row<'_>) -> rusqlite::Result<CoverageStatus> {
    let timeframe: String = row.get(1)?;
    Ok(CoverageStatus {
        symbol: row.get(0)?,
        timeframe: timeframe.parse().map_err(|e: AppError| conversion_error(1, e))?,
        from_ts: get_opt_ts(row, 2)?,
        to_ts: get_opt_ts(row, 3)?,
        last_success_at: get_opt_ts(row, 4)?,
        last_rows_written: row.get(5)?,
        updated_at: get_ts(row, 6)?,
    })
}

pub fn get_coverage(conn: &Connection, symbol: &str, timeframe: &str) -> Result<Option<CoverageStatus>> {
    let sql = format!(
        "SELECT {} FROM coverage_status WHERE symbol = ?1 AND timeframe = ?2",
        SELECT_COLUMNS
    );
    let status = conn
        .query_row(&sql, params![symbol, timeframe], map_row)
        .optional()?;
    Ok(status)
}

/// Coverage rows, optionally filtered by symbol and/or timeframe
pub fn list_coverage(
    conn: &Connection,
    symbol: Option<&str>,
    timeframe: Option<&str>,
) -> Result<Vec<CoverageStatus>> {
    let sql = format!(
        "SELECT {} FROM coverage_status
         WHERE (?1 IS NULL OR symbol = ?1) AND (?2 IS NULL OR timeframe = ?2)
         ORDER BY symbol, timeframe",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![symbol, timeframe], map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Apply a monotonic merge to the coverage row inside one transaction.
///
/// `merge` receives the current row (if any) and returns the new range, or
/// `None` to leave the range untouched. `last_success_at` and
/// `last_rows_written` are recorded either way since this is only called
/// after bars were written.
pub fn extend_coverage<F>(
    conn: &mut Connection,
    symbol: &str,
    timeframe: &str,
    rows_written: i64,
    now: DateTime<Utc>,
    merge: F,
) -> Result<CoverageStatus>
where
    F: FnOnce(Option<&CoverageStatus>) -> Option<(DateTime<Utc>, DateTime<Utc>)>,
{
    let tx = conn.transaction()?;

    let current = get_coverage(&tx, symbol, timeframe)?;
    let merged = merge(current.as_ref());

    if let (Some((from, to)), Some((cur_from, cur_to))) =
        (merged, current.as_ref().and_then(|c| c.range()))
    {
        if from > cur_from || to < cur_to || from > to {
            return Err(AppError::Internal(format!(
                "Coverage merge for {} {} would shrink [{}, {}] to [{}, {}]",
                symbol, timeframe, cur_from, cur_to, from, to
            )));
        }
    }

    let now_sql = ts_to_sql(&now);
    match merged {
        Some((from, to)) => {
            tx.execute(
                "INSERT INTO coverage_status
                    (symbol, timeframe, from_ts, to_ts, last_success_at, last_rows_written, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5)
                 ON CONFLICT (symbol, timeframe) DO UPDATE SET
                    from_ts = excluded.from_ts,
                    to_ts = excluded.to_ts,
                    last_success_at = excluded.last_success_at,
                    last_rows_written = excluded.last_rows_written,
                    updated_at = excluded.updated_at",
                params![symbol, timeframe, ts_to_sql(&from), ts_to_sql(&to), now_sql, rows_written],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO coverage_status
                    (symbol, timeframe, last_success_at, last_rows_written, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?3)
                 ON CONFLICT (symbol, timeframe) DO UPDATE SET
                    last_success_at = excluded.last_success_at,
                    last_rows_written = excluded.last_rows_written,
                    updated_at = excluded.updated_at",
                params![symbol, timeframe, now_sql, rows_written],
            )?;
        }
    }

    let updated = get_coverage(&tx, symbol, timeframe)?.ok_or_else(|| {
        AppError::Internal(format!("Coverage row for {} {} missing after write", symbol, timeframe))
    })?;
    tx.commit()?;

    Ok(updated)
}
