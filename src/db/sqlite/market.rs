//! Market holidays and timings management
//!
//! Backing store for the trading calendar used by gap detection.

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

// ============================================================================
// Market Holiday Types
// ============================================================================

/// Market holiday entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHoliday {
    pub id: i64,
    pub exchange: String,
    pub date: String,
    pub description: Option<String>,
}

/// Create request for a market holiday
#[derive(Debug, Clone, Deserialize)]
pub struct CreateHolidayRequest {
    pub exchange: String,
    pub date: String,
    pub description: Option<String>,
}

// ============================================================================
// Market Holiday Functions
// ============================================================================

/// Create a new market holiday (no-op if it already exists)
pub fn create_holiday(conn: &Connection, req: &CreateHolidayRequest) -> Result<MarketHoliday> {
    conn.execute(
        "INSERT INTO market_holidays (exchange, date, description) VALUES (?1, ?2, ?3)
         ON CONFLICT (exchange, date) DO UPDATE SET description = excluded.description",
        params![req.exchange, req.date, req.description],
    )?;

    let id: i64 = conn.query_row(
        "SELECT id FROM market_holidays WHERE exchange = ?1 AND date = ?2",
        params![req.exchange, req.date],
        |row| row.get(0),
    )?;

    tracing::info!("Created market holiday: {} {} ({})", req.exchange, req.date, id);

    Ok(MarketHoliday {
        id,
        exchange: req.exchange.clone(),
        date: req.date.clone(),
        description: req.description.clone(),
    })
}

/// Get all holidays for an exchange
pub fn get_holidays_by_exchange(conn: &Connection, exchange: &str) -> Result<Vec<MarketHoliday>> {
    let mut stmt = conn.prepare(
        "SELECT id, exchange, date, description FROM market_holidays
         WHERE exchange = ?1 ORDER BY date",
    )?;

    let holidays = stmt
        .query_map(params![exchange], |row| {
            Ok(MarketHoliday {
                id: row.get(0)?,
                exchange: row.get(1)?,
                date: row.get(2)?,
                description: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(holidays)
}

/// Delete a market holiday
pub fn delete_holiday(conn: &Connection, id: i64) -> Result<bool> {
    let rows = conn.execute("DELETE FROM market_holidays WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

// ============================================================================
// Market Timings
// ============================================================================

/// Market timing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTiming {
    pub id: i64,
    pub exchange: String,
    pub timezone: String,
    pub market_open: String,
    pub market_close: String,
}

/// Get timing for a specific exchange
pub fn get_timing_by_exchange(conn: &Connection, exchange: &str) -> Result<Option<MarketTiming>> {
    let timing = conn
        .query_row(
            "SELECT id, exchange, timezone, market_open, market_close
             FROM market_timings WHERE exchange = ?1",
            params![exchange],
            |row| {
                Ok(MarketTiming {
                    id: row.get(0)?,
                    exchange: row.get(1)?,
                    timezone: row.get(2)?,
                    market_open: row.get(3)?,
                    market_close: row.get(4)?,
                })
            },
        )
        .optional()?;

    Ok(timing)
}

/// Create or replace the session timing for an exchange
pub fn upsert_timing(
    conn: &Connection,
    exchange: &str,
    timezone: &str,
    market_open: &str,
    market_close: &str,
) -> Result<MarketTiming> {
    conn.execute(
        "INSERT INTO market_timings (exchange, timezone, market_open, market_close)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (exchange) DO UPDATE SET
           timezone = excluded.timezone,
           market_open = excluded.market_open,
           market_close = excluded.market_close",
        params![exchange, timezone, market_open, market_close],
    )?;

    get_timing_by_exchange(conn, exchange)?.ok_or_else(|| {
        crate::error::AppError::NotFound(format!("Exchange {} not found", exchange))
    })
}
