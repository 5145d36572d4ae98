//! Job run ledger
//!
//! Every status change is a guarded compare-and-set on (id, status, attempt)
//! so that a late writer from a superseded attempt can never clobber the
//! current one. Callers get `false` back when the guard did not match.

use super::connection::{get_opt_ts, get_ts, ts_to_sql};
use super::job_definitions::conversion_error;
use crate::db::sqlite::models::{JobRun, JobStatus, NewJobRun};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

const SELECT_COLUMNS: &str = "id, job_definition_id, symbol, timeframe, job_type, slice_start, slice_end,
     status, attempt, max_attempts, priority, triggered_by, provider, rows_written,
     progress_percent, error_code, error_message, next_eligible_at, created_at,
     started_at, finished_at, updated_at";

fn map_row(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    let timeframe: String = row.get(3)?;
    let job_type: String = row.get(4)?;
    let status: String = row.get(7)?;
    let triggered_by: String = row.get(11)?;
    Ok(JobRun {
        id: row.get(0)?,
        job_definition_id: row.get(1)?,
        symbol: row.get(2)?,
        timeframe: timeframe.parse().map_err(|e: AppError| conversion_error(3, e))?,
        job_type: job_type.parse().map_err(|e: AppError| conversion_error(4, e))?,
        slice_start: get_ts(row, 5)?,
        slice_end: get_ts(row, 6)?,
        status: status.parse().map_err(|e: AppError| conversion_error(7, e))?,
        attempt: row.get(8)?,
        max_attempts: row.get(9)?,
        priority: row.get(10)?,
        triggered_by: triggered_by.parse().map_err(|e: AppError| conversion_error(11, e))?,
        provider: row.get(12)?,
        rows_written: row.get(13)?,
        progress_percent: row.get(14)?,
        error_code: row.get(15)?,
        error_message: row.get(16)?,
        next_eligible_at: get_opt_ts(row, 17)?,
        created_at: get_ts(row, 18)?,
        started_at: get_opt_ts(row, 19)?,
        finished_at: get_opt_ts(row, 20)?,
        updated_at: get_ts(row, 21)?,
    })
}

pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<JobRun>> {
    let sql = format!("SELECT {} FROM job_runs WHERE id = ?1", SELECT_COLUMNS);
    let run = conn.query_row(&sql, params![id], map_row).optional()?;
    Ok(run)
}

fn require(conn: &Connection, id: i64) -> Result<JobRun> {
    get_by_id(conn, id)?.ok_or_else(|| AppError::NotFound(format!("Job run {} not found", id)))
}

/// True when a run for the pair is queued, running, or failed with retries
/// left, and its slice intersects `[start, end]`.
pub fn has_overlapping_active(
    conn: &Connection,
    symbol: &str,
    timeframe: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM job_runs
            WHERE symbol = ?1 AND timeframe = ?2
              AND slice_start <= ?4 AND slice_end >= ?3
              AND (status IN ('queued', 'running')
                   OR (status = 'failed' AND attempt < max_attempts))
         )",
        params![symbol, timeframe, ts_to_sql(&start), ts_to_sql(&end)],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Insert a queued run unless an overlapping active run already exists.
///
/// The check and the insert share one immediate transaction so two
/// enqueuers can never both pass the overlap test.
pub fn insert_if_no_overlap(
    conn: &mut Connection,
    run: &NewJobRun,
    now: DateTime<Utc>,
) -> Result<Option<JobRun>> {
    if run.slice_start > run.slice_end {
        return Err(AppError::Validation(format!(
            "Slice start {} is after slice end {}",
            run.slice_start, run.slice_end
        )));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if has_overlapping_active(
        &tx,
        &run.symbol,
        run.timeframe.as_str(),
        run.slice_start,
        run.slice_end,
    )? {
        return Ok(None);
    }

    let now_sql = ts_to_sql(&now);
    tx.execute(
        "INSERT INTO job_runs
            (job_definition_id, symbol, timeframe, job_type, slice_start, slice_end,
             status, attempt, max_attempts, priority, triggered_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', 1, ?7, ?8, ?9, ?10, ?10)",
        params![
            run.job_definition_id,
            run.symbol,
            run.timeframe.as_str(),
            run.job_type.as_str(),
            ts_to_sql(&run.slice_start),
            ts_to_sql(&run.slice_end),
            run.max_attempts,
            run.priority,
            run.triggered_by.as_str(),
            now_sql,
        ],
    )?;
    let id = tx.last_insert_rowid();
    let inserted = require(&tx, id)?;
    tx.commit()?;

    Ok(Some(inserted))
}

/// Atomically move the best queued run to `running`, but only while fewer
/// than `max_concurrent` runs are running.
pub fn claim_next(conn: &mut Connection, max_concurrent: i64, now: DateTime<Utc>) -> Result<Option<JobRun>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let running = count_by_status(&tx, JobStatus::Running)?;
    if running >= max_concurrent {
        return Ok(None);
    }

    let candidate: Option<i64> = tx
        .query_row(
            "SELECT id FROM job_runs WHERE status = 'queued'
             ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let Some(id) = candidate else {
        return Ok(None);
    };

    let now_sql = ts_to_sql(&now);
    let rows = tx.execute(
        "UPDATE job_runs SET
            status = 'running', started_at = ?1, finished_at = NULL,
            rows_written = 0, progress_percent = 0,
            error_code = NULL, error_message = NULL, updated_at = ?1
         WHERE id = ?2 AND status = 'queued'",
        params![now_sql, id],
    )?;
    if rows != 1 {
        return Ok(None);
    }

    let claimed = require(&tx, id)?;
    tx.commit()?;
    Ok(Some(claimed))
}

/// Record which provider is serving the current attempt
pub fn set_provider(conn: &Connection, id: i64, attempt: i64, provider: &str, now: DateTime<Utc>) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE job_runs SET provider = ?1, updated_at = ?2
         WHERE id = ?3 AND status = 'running' AND attempt = ?4",
        params![provider, ts_to_sql(&now), id, attempt],
    )?;
    Ok(rows == 1)
}

pub fn update_progress(
    conn: &Connection,
    id: i64,
    attempt: i64,
    rows_written: i64,
    progress_percent: f64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE job_runs SET rows_written = ?1, progress_percent = ?2, updated_at = ?3
         WHERE id = ?4 AND status = 'running' AND attempt = ?5",
        params![rows_written, progress_percent.clamp(0.0, 100.0), ts_to_sql(&now), id, attempt],
    )?;
    Ok(rows == 1)
}

pub fn mark_success(
    conn: &Connection,
    id: i64,
    attempt: i64,
    rows_written: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_sql = ts_to_sql(&now);
    let rows = conn.execute(
        "UPDATE job_runs SET
            status = 'success', rows_written = ?1, progress_percent = 100,
            error_code = NULL, error_message = NULL, next_eligible_at = NULL,
            finished_at = ?2, updated_at = ?2
         WHERE id = ?3 AND status = 'running' AND attempt = ?4",
        params![rows_written, now_sql, id, attempt],
    )?;
    Ok(rows == 1)
}

/// running -> failed with the error and partial row count recorded.
/// `next_eligible_at` is the earliest time `retry_failed` may requeue it.
#[allow(clippy::too_many_arguments)]
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    attempt: i64,
    rows_written: i64,
    error_code: &str,
    error_message: &str,
    next_eligible_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_sql = ts_to_sql(&now);
    let rows = conn.execute(
        "UPDATE job_runs SET
            status = 'failed', error_code = ?1, error_message = ?2,
            next_eligible_at = ?3, finished_at = ?4, updated_at = ?4, rows_written = ?7
         WHERE id = ?5 AND status = 'running' AND attempt = ?6",
        params![
            error_code,
            error_message,
            next_eligible_at.as_ref().map(ts_to_sql),
            now_sql,
            id,
            attempt,
            rows_written
        ],
    )?;
    Ok(rows == 1)
}

/// failed -> queued for every run with attempts left whose backoff elapsed.
/// Returns the requeued runs.
pub fn requeue_eligible_failed(conn: &mut Connection, now: DateTime<Utc>) -> Result<Vec<JobRun>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now_sql = ts_to_sql(&now);

    let candidates: Vec<(i64, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT id, attempt FROM job_runs
             WHERE status = 'failed' AND attempt < max_attempts
               AND (next_eligible_at IS NULL OR next_eligible_at <= ?1)
             ORDER BY priority DESC, created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![now_sql], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let mut requeued = Vec::with_capacity(candidates.len());
    for (id, attempt) in candidates {
        let rows = tx.execute(
            "UPDATE job_runs SET
                status = 'queued', attempt = attempt + 1,
                error_code = NULL, error_message = NULL, next_eligible_at = NULL,
                started_at = NULL, finished_at = NULL, progress_percent = 0,
                updated_at = ?1
             WHERE id = ?2 AND status = 'failed' AND attempt = ?3",
            params![now_sql, id, attempt],
        )?;
        if rows == 1 {
            requeued.push(require(&tx, id)?);
        }
    }

    tx.commit()?;
    Ok(requeued)
}

/// All runs currently in `running`, oldest start first
pub fn list_running(conn: &Connection) -> Result<Vec<JobRun>> {
    let sql = format!(
        "SELECT {} FROM job_runs WHERE status = 'running' ORDER BY started_at ASC, id ASC",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let runs = stmt
        .query_map([], map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(runs)
}

/// Watchdog recovery of a stuck run: back to queued with the next attempt
/// while budget remains, otherwise failed with `error_code`.
pub fn recover_stale(
    conn: &Connection,
    run: &JobRun,
    error_code: &str,
    error_message: &str,
    now: DateTime<Utc>,
) -> Result<Option<JobRun>> {
    let now_sql = ts_to_sql(&now);
    let rows = if run.attempt < run.max_attempts {
        conn.execute(
            "UPDATE job_runs SET
                status = 'queued', attempt = attempt + 1,
                error_code = ?1, error_message = ?2,
                started_at = NULL, progress_percent = 0, updated_at = ?3
             WHERE id = ?4 AND status = 'running' AND attempt = ?5",
            params![error_code, error_message, now_sql, run.id, run.attempt],
        )?
    } else {
        conn.execute(
            "UPDATE job_runs SET
                status = 'failed', error_code = ?1, error_message = ?2,
                next_eligible_at = NULL, finished_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = 'running' AND attempt = ?5",
            params![error_code, error_message, now_sql, run.id, run.attempt],
        )?
    };

    if rows == 1 {
        get_by_id(conn, run.id)
    } else {
        Ok(None)
    }
}

pub fn count_by_status(conn: &Connection, status: JobStatus) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM job_runs WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Most recent runs, optionally narrowed to a symbol and/or timeframe
pub fn list_recent(
    conn: &Connection,
    symbol: Option<&str>,
    timeframe: Option<&str>,
    limit: i64,
) -> Result<Vec<JobRun>> {
    let sql = format!(
        "SELECT {} FROM job_runs
         WHERE (?1 IS NULL OR symbol = ?1) AND (?2 IS NULL OR timeframe = ?2)
         ORDER BY created_at DESC, id DESC LIMIT ?3",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let runs = stmt
        .query_map(params![symbol, timeframe, limit], map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(runs)
}

/// Failed runs with retry budget left, pending backoff or not
pub fn list_retrying(conn: &Connection, symbol: &str, timeframe: &str) -> Result<Vec<JobRun>> {
    let sql = format!(
        "SELECT {} FROM job_runs
         WHERE symbol = ?1 AND timeframe = ?2 AND status = 'failed' AND attempt < max_attempts
         ORDER BY slice_start ASC",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let runs = stmt
        .query_map(params![symbol, timeframe], map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::connection::create_memory_connection;
    use crate::db::sqlite::migrations::run_migrations;
    use crate::db::sqlite::models::{JobType, TriggerSource};
    use crate::market::Timeframe;
    use chrono::{Duration, TimeZone};

    fn setup() -> Connection {
        let conn = create_memory_connection().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO job_definitions
                (id, job_type, symbol, timeframe, window_days, slice_hours, created_at, updated_at)
             VALUES (1, 'fetch_intraday', 'AAPL', '1h', 7, 24, 'x', 'x')",
            [],
        )
        .unwrap();
        conn
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 13, 0, 0).unwrap()
    }

    fn new_run(start_h: i64, end_h: i64, priority: i64) -> NewJobRun {
        NewJobRun {
            job_definition_id: 1,
            symbol: "AAPL".to_string(),
            timeframe: Timeframe::H1,
            job_type: JobType::FetchIntraday,
            slice_start: t0() + Duration::hours(start_h),
            slice_end: t0() + Duration::hours(end_h),
            max_attempts: 2,
            priority,
            triggered_by: TriggerSource::Tick,
        }
    }

    #[test]
    fn test_overlapping_insert_is_skipped() {
        let mut conn = setup();
        let now = t0() + Duration::days(1);

        let first = insert_if_no_overlap(&mut conn, &new_run(0, 5, 0), now).unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().attempt, 1);

        // Shares the boundary bar at +5h
        assert!(insert_if_no_overlap(&mut conn, &new_run(5, 9, 0), now).unwrap().is_none());
        // Disjoint
        assert!(insert_if_no_overlap(&mut conn, &new_run(6, 9, 0), now).unwrap().is_some());
    }

    #[test]
    fn test_claim_respects_priority_and_cap() {
        let mut conn = setup();
        let now = t0() + Duration::days(1);

        insert_if_no_overlap(&mut conn, &new_run(0, 1, 0), now).unwrap();
        let urgent = insert_if_no_overlap(&mut conn, &new_run(2, 3, 100), now).unwrap().unwrap();

        let claimed = claim_next(&mut conn, 1, now).unwrap().unwrap();
        assert_eq!(claimed.id, urgent.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.started_at, Some(now));

        // Cap of one already reached
        assert!(claim_next(&mut conn, 1, now).unwrap().is_none());
        assert!(claim_next(&mut conn, 2, now).unwrap().is_some());
        assert!(claim_next(&mut conn, 5, now).unwrap().is_none());
    }

    #[test]
    fn test_guarded_updates_ignore_stale_attempts() {
        let mut conn = setup();
        let now = t0() + Duration::days(1);
        let run = insert_if_no_overlap(&mut conn, &new_run(0, 1, 0), now).unwrap().unwrap();
        let claimed = claim_next(&mut conn, 4, now).unwrap().unwrap();

        assert!(!mark_success(&conn, run.id, claimed.attempt + 1, 10, now).unwrap());
        assert!(mark_failed(&conn, run.id, claimed.attempt, 0, "TIMEOUT", "slow", Some(now), now).unwrap());
        // Already failed; a late success must not land
        assert!(!mark_success(&conn, run.id, claimed.attempt, 10, now).unwrap());
        assert_eq!(get_by_id(&conn, run.id).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_requeue_honours_backoff_and_budget() {
        let mut conn = setup();
        let now = t0() + Duration::days(1);
        let run = insert_if_no_overlap(&mut conn, &new_run(0, 1, 0), now).unwrap().unwrap();
        claim_next(&mut conn, 4, now).unwrap();
        mark_failed(&conn, run.id, 1, 0, "TIMEOUT", "slow", Some(now + Duration::seconds(30)), now).unwrap();

        assert!(requeue_eligible_failed(&mut conn, now).unwrap().is_empty());
        let requeued = requeue_eligible_failed(&mut conn, now + Duration::seconds(30)).unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].attempt, 2);
        assert_eq!(requeued[0].status, JobStatus::Queued);

        // Second failure exhausts max_attempts = 2
        claim_next(&mut conn, 4, now).unwrap();
        mark_failed(&conn, run.id, 2, 0, "TIMEOUT", "slow", None, now).unwrap();
        assert!(requeue_eligible_failed(&mut conn, now + Duration::days(1)).unwrap().is_empty());
        let exhausted = get_by_id(&conn, run.id).unwrap().unwrap();
        assert!(exhausted.is_exhausted());
        assert_eq!(exhausted.reported_status(), "failed-exhausted");

        // Exhausted runs no longer block the range
        assert!(insert_if_no_overlap(&mut conn, &new_run(0, 1, 0), now).unwrap().is_some());
    }

    #[test]
    fn test_recover_stale_requeues_then_fails() {
        let mut conn = setup();
        let now = t0() + Duration::days(1);
        insert_if_no_overlap(&mut conn, &new_run(0, 1, 0), now).unwrap();

        let first = claim_next(&mut conn, 4, now).unwrap().unwrap();
        let recovered = recover_stale(&conn, &first, "WATCHDOG_TIMEOUT", "stuck", now).unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Queued);
        assert_eq!(recovered.attempt, 2);

        let second = claim_next(&mut conn, 4, now).unwrap().unwrap();
        let failed = recover_stale(&conn, &second, "WATCHDOG_TIMEOUT", "stuck", now).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_code.as_deref(), Some("WATCHDOG_TIMEOUT"));
        assert!(failed.is_exhausted());

        // Guard mismatch once the row has moved on
        assert!(recover_stale(&conn, &second, "WATCHDOG_TIMEOUT", "stuck", now).unwrap().is_none());
    }
}
