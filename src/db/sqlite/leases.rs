//! Advisory leases on job definitions
//!
//! A lease is a row (definition id, holder id, expiry). Acquiring succeeds
//! when no row exists, the existing lease has expired, or the caller
//! already holds it. Expired leases are simply taken over, so a crashed
//! orchestrator never blocks a definition for longer than the TTL.

use super::connection::ts_to_sql;
use crate::error::{AppError, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// Try to take or renew the lease. Returns `AppError::Concurrency` when
/// another holder owns an unexpired lease.
pub fn acquire(
    conn: &Connection,
    job_definition_id: i64,
    holder_id: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        "INSERT INTO definition_leases (job_definition_id, holder_id, expires_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (job_definition_id) DO UPDATE SET
            holder_id = excluded.holder_id,
            expires_at = excluded.expires_at
         WHERE definition_leases.expires_at <= ?4
            OR definition_leases.holder_id = excluded.holder_id",
        params![
            job_definition_id,
            holder_id,
            ts_to_sql(&(now + ttl)),
            ts_to_sql(&now)
        ],
    )?;

    if changed == 1 {
        Ok(())
    } else {
        let holder = current_holder(conn, job_definition_id)?.unwrap_or_default();
        Err(AppError::Concurrency(format!(
            "Definition {} is leased by {}",
            job_definition_id, holder
        )))
    }
}

/// Release the lease if still held by `holder_id`
pub fn release(conn: &Connection, job_definition_id: i64, holder_id: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM definition_leases WHERE job_definition_id = ?1 AND holder_id = ?2",
        params![job_definition_id, holder_id],
    )?;
    Ok(rows > 0)
}

pub fn current_holder(conn: &Connection, job_definition_id: i64) -> Result<Option<String>> {
    let holder = conn
        .query_row(
            "SELECT holder_id FROM definition_leases WHERE job_definition_id = ?1",
            params![job_definition_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(holder)
}

/// Drop expired leases
pub fn purge_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let rows = conn.execute(
        "DELETE FROM definition_leases WHERE expires_at <= ?1",
        params![ts_to_sql(&now)],
    )?;
    Ok(rows)
}
