//! Job definition registry

use super::connection::{get_ts, ts_to_sql};
use crate::db::sqlite::models::{JobDefinition, JobType, NewJobDefinition};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Upper bound on a definition's window
pub const MAX_WINDOW_DAYS: i64 = 3650;

const SELECT_COLUMNS: &str = "id, job_type, symbol, timeframe, window_days, slice_hours, priority,
                              enabled, created_at, updated_at";

fn map_row(row: &Row<'_>) -> rusqlite::Result<JobDefinition> {
    let job_type: String = row.get(1)?;
    let timeframe: String = row.get(3)?;
    Ok(JobDefinition {
        id: row.get(0)?,
        job_type: job_type.parse().map_err(|e: AppError| conversion_error(1, e))?,
        symbol: row.get(2)?,
        timeframe: timeframe.parse().map_err(|e: AppError| conversion_error(3, e))?,
        window_days: row.get(4)?,
        slice_hours: row.get(5)?,
        priority: row.get(6)?,
        enabled: row.get::<_, i32>(7)? == 1,
        created_at: get_ts(row, 8)?,
        updated_at: get_ts(row, 9)?,
    })
}

pub(crate) fn conversion_error(idx: usize, err: AppError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.to_string().into())
}

fn validate(def: &NewJobDefinition) -> Result<()> {
    if def.symbol.trim().is_empty() {
        return Err(AppError::Validation("Symbol is required".to_string()));
    }
    if def.window_days <= 0 || def.window_days > MAX_WINDOW_DAYS {
        return Err(AppError::Validation(format!(
            "window_days must be within 1..={}, got {}",
            MAX_WINDOW_DAYS, def.window_days
        )));
    }
    if let Some(hours) = def.slice_hours {
        if hours <= 0 {
            return Err(AppError::Validation(format!("slice_hours must be positive, got {}", hours)));
        }
    }
    Ok(())
}

/// Enabled definitions in scheduling order: priority desc, then oldest first
pub fn list_enabled(conn: &Connection) -> Result<Vec<JobDefinition>> {
    let sql = format!(
        "SELECT {} FROM job_definitions WHERE enabled = 1
         ORDER BY priority DESC, created_at ASC, id ASC",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let defs = stmt
        .query_map([], map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(defs)
}

/// All definitions, enabled or not
pub fn list_all(conn: &Connection) -> Result<Vec<JobDefinition>> {
    let sql = format!(
        "SELECT {} FROM job_definitions ORDER BY priority DESC, created_at ASC, id ASC",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let defs = stmt
        .query_map([], map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(defs)
}

pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<JobDefinition>> {
    let sql = format!("SELECT {} FROM job_definitions WHERE id = ?1", SELECT_COLUMNS);
    let def = conn.query_row(&sql, params![id], map_row).optional()?;
    Ok(def)
}

pub fn get_by_key(
    conn: &Connection,
    symbol: &str,
    timeframe: &str,
    job_type: JobType,
) -> Result<Option<JobDefinition>> {
    let sql = format!(
        "SELECT {} FROM job_definitions WHERE symbol = ?1 AND timeframe = ?2 AND job_type = ?3",
        SELECT_COLUMNS
    );
    let def = conn
        .query_row(&sql, params![symbol, timeframe, job_type.as_str()], map_row)
        .optional()?;
    Ok(def)
}

/// Insert a definition, or update the existing one for the same
/// (symbol, timeframe, job_type).
///
/// On conflict the window only ever widens and the definition is
/// re-enabled unless the caller explicitly disables it.
pub fn upsert(
    conn: &Connection,
    def: &NewJobDefinition,
    default_slice_hours: i64,
    now: DateTime<Utc>,
) -> Result<JobDefinition> {
    validate(def)?;
    let symbol = def.symbol.trim().to_uppercase();
    let now_sql = ts_to_sql(&now);

    conn.execute(
        "INSERT INTO job_definitions
            (job_type, symbol, timeframe, window_days, slice_hours, priority, enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
         ON CONFLICT (symbol, timeframe, job_type) DO UPDATE SET
            window_days = MAX(job_definitions.window_days, excluded.window_days),
            slice_hours = COALESCE(?9, job_definitions.slice_hours),
            priority = COALESCE(?10, job_definitions.priority),
            enabled = COALESCE(?11, 1),
            updated_at = excluded.updated_at",
        params![
            def.job_type.as_str(),
            symbol,
            def.timeframe.as_str(),
            def.window_days,
            def.slice_hours.unwrap_or(default_slice_hours),
            def.priority.unwrap_or(0),
            def.enabled.unwrap_or(true) as i32,
            now_sql,
            def.slice_hours,
            def.priority,
            def.enabled.map(|e| e as i32),
        ],
    )?;

    get_by_key(conn, &symbol, def.timeframe.as_str(), def.job_type)?
        .ok_or_else(|| AppError::Internal(format!("Definition {} vanished after upsert", symbol)))
}

/// Toggle a definition on or off
pub fn set_enabled(conn: &Connection, id: i64, enabled: bool, now: DateTime<Utc>) -> Result<JobDefinition> {
    let rows = conn.execute(
        "UPDATE job_definitions SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
        params![enabled as i32, ts_to_sql(&now), id],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("Job definition {} not found", id)));
    }
    get_by_id(conn, id)?.ok_or_else(|| AppError::NotFound(format!("Job definition {} not found", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::connection::create_memory_connection;
    use crate::db::sqlite::migrations::run_migrations;
    use crate::market::Timeframe;
    use chrono::TimeZone;

    fn setup() -> Connection {
        let conn = create_memory_connection().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn new_def(symbol: &str, window_days: i64, priority: Option<i64>) -> NewJobDefinition {
        NewJobDefinition {
            job_type: JobType::FetchIntraday,
            symbol: symbol.to_string(),
            timeframe: Timeframe::H1,
            window_days,
            slice_hours: None,
            priority,
            enabled: None,
        }
    }

    #[test]
    fn test_upsert_is_unique_per_key_and_widens_window() {
        let conn = setup();
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();

        let first = upsert(&conn, &new_def("aapl", 30, Some(5)), 24, now).unwrap();
        let second = upsert(&conn, &new_def("AAPL", 7, None), 24, now).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.symbol, "AAPL");
        assert_eq!(second.window_days, 30);
        assert_eq!(second.priority, 5);
        assert_eq!(list_all(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_list_enabled_orders_by_priority_then_age() {
        let conn = setup();
        let t0 = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(1);

        upsert(&conn, &new_def("MSFT", 7, Some(1)), 24, t0).unwrap();
        upsert(&conn, &new_def("AAPL", 7, Some(1)), 24, t1).unwrap();
        upsert(&conn, &new_def("TSLA", 7, Some(9)), 24, t1).unwrap();
        let disabled = upsert(&conn, &new_def("NVDA", 7, Some(50)), 24, t1).unwrap();
        set_enabled(&conn, disabled.id, false, t1).unwrap();

        let symbols: Vec<String> = list_enabled(&conn).unwrap().into_iter().map(|d| d.symbol).collect();
        assert_eq!(symbols, vec!["TSLA", "MSFT", "AAPL"]);
    }

    #[test]
    fn test_rejects_non_positive_window() {
        let conn = setup();
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
        assert!(upsert(&conn, &new_def("AAPL", 0, None), 24, now).is_err());
    }

    #[test]
    fn test_rejects_oversized_window() {
        let conn = setup();
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();

        let err = upsert(&conn, &new_def("AAPL", 200_000_000, None), 24, now).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(list_all(&conn).unwrap().is_empty());

        let def = upsert(&conn, &new_def("AAPL", MAX_WINDOW_DAYS, None), 24, now).unwrap();
        assert_eq!(def.window_days, MAX_WINDOW_DAYS);
    }
}
