//! SQLite database module

pub mod models;
pub mod connection;
pub mod coverage;
pub mod job_definitions;
pub mod job_runs;
pub mod job_stats;
pub mod leases;
pub mod market;
mod migrations;
pub mod settings;

use crate::error::Result;
use crate::market::TradingCalendar;
use chrono::{DateTime, Duration, Utc};
use job_stats::JobStats;
use market::{CreateHolidayRequest, MarketHoliday, MarketTiming};
use models::*;
use parking_lot::Mutex;
use rusqlite::Connection;
use settings::SettingsUpdate;
use std::path::Path;

/// SQLite database wrapper
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    /// Create new SQLite database connection
    pub fn new(path: &Path) -> Result<Self> {
        let conn = connection::create_connection(path)?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        // Run migrations
        db.run_migrations()?;

        Ok(db)
    }

    /// Private in-memory database, migrated
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(connection::create_memory_connection()?),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();
        migrations::run_migrations(&conn)
    }

    // ========== Job Definition Methods ==========

    pub fn list_enabled_definitions(&self) -> Result<Vec<JobDefinition>> {
        let conn = self.conn.lock();
        job_definitions::list_enabled(&conn)
    }

    pub fn list_definitions(&self) -> Result<Vec<JobDefinition>> {
        let conn = self.conn.lock();
        job_definitions::list_all(&conn)
    }

    pub fn get_definition(&self, id: i64) -> Result<Option<JobDefinition>> {
        let conn = self.conn.lock();
        job_definitions::get_by_id(&conn, id)
    }

    /// Insert or widen a definition
    pub fn upsert_definition(
        &self,
        def: &NewJobDefinition,
        default_slice_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<JobDefinition> {
        let conn = self.conn.lock();
        job_definitions::upsert(&conn, def, default_slice_hours, now)
    }

    pub fn set_definition_enabled(&self, id: i64, enabled: bool, now: DateTime<Utc>) -> Result<JobDefinition> {
        let conn = self.conn.lock();
        job_definitions::set_enabled(&conn, id, enabled, now)
    }

    // ========== Lease Methods ==========

    pub fn acquire_lease(&self, def_id: i64, holder_id: &str, ttl: Duration, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        leases::acquire(&conn, def_id, holder_id, ttl, now)
    }

    pub fn release_lease(&self, def_id: i64, holder_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        leases::release(&conn, def_id, holder_id)
    }

    pub fn purge_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        leases::purge_expired(&conn, now)
    }

    // ========== Job Run Methods ==========

    pub fn get_run(&self, id: i64) -> Result<Option<JobRun>> {
        let conn = self.conn.lock();
        job_runs::get_by_id(&conn, id)
    }

    /// Enqueue a run unless an overlapping active one exists
    pub fn enqueue_run(&self, run: &NewJobRun, now: DateTime<Utc>) -> Result<Option<JobRun>> {
        let mut conn = self.conn.lock();
        job_runs::insert_if_no_overlap(&mut conn, run, now)
    }

    pub fn has_overlapping_run(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        job_runs::has_overlapping_active(&conn, symbol, timeframe, start, end)
    }

    pub fn claim_next_run(&self, max_concurrent: i64, now: DateTime<Utc>) -> Result<Option<JobRun>> {
        let mut conn = self.conn.lock();
        job_runs::claim_next(&mut conn, max_concurrent, now)
    }

    pub fn set_run_provider(&self, id: i64, attempt: i64, provider: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        job_runs::set_provider(&conn, id, attempt, provider, now)
    }

    pub fn update_run_progress(
        &self,
        id: i64,
        attempt: i64,
        rows_written: i64,
        progress_percent: f64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        job_runs::update_progress(&conn, id, attempt, rows_written, progress_percent, now)
    }

    pub fn mark_run_success(&self, id: i64, attempt: i64, rows_written: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        job_runs::mark_success(&conn, id, attempt, rows_written, now)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mark_run_failed(
        &self,
        id: i64,
        attempt: i64,
        rows_written: i64,
        error_code: &str,
        error_message: &str,
        next_eligible_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        job_runs::mark_failed(&conn, id, attempt, rows_written, error_code, error_message, next_eligible_at, now)
    }

    pub fn requeue_eligible_failed(&self, now: DateTime<Utc>) -> Result<Vec<JobRun>> {
        let mut conn = self.conn.lock();
        job_runs::requeue_eligible_failed(&mut conn, now)
    }

    pub fn list_running_runs(&self) -> Result<Vec<JobRun>> {
        let conn = self.conn.lock();
        job_runs::list_running(&conn)
    }

    pub fn recover_stale_run(
        &self,
        run: &JobRun,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRun>> {
        let conn = self.conn.lock();
        job_runs::recover_stale(&conn, run, error_code, error_message, now)
    }

    pub fn count_runs_by_status(&self, status: JobStatus) -> Result<i64> {
        let conn = self.conn.lock();
        job_runs::count_by_status(&conn, status)
    }

    pub fn list_recent_runs(&self, symbol: Option<&str>, timeframe: Option<&str>, limit: i64) -> Result<Vec<JobRun>> {
        let conn = self.conn.lock();
        job_runs::list_recent(&conn, symbol, timeframe, limit)
    }

    pub fn list_retrying_runs(&self, symbol: &str, timeframe: &str) -> Result<Vec<JobRun>> {
        let conn = self.conn.lock();
        job_runs::list_retrying(&conn, symbol, timeframe)
    }

    pub fn get_job_stats(
        &self,
        since: DateTime<Utc>,
        symbol: Option<&str>,
        timeframe: Option<&str>,
    ) -> Result<JobStats> {
        let conn = self.conn.lock();
        job_stats::get_stats(&conn, since, symbol, timeframe)
    }

    // ========== Coverage Methods ==========

    pub fn get_coverage(&self, symbol: &str, timeframe: &str) -> Result<Option<CoverageStatus>> {
        let conn = self.conn.lock();
        coverage::get_coverage(&conn, symbol, timeframe)
    }

    pub fn list_coverage(&self, symbol: Option<&str>, timeframe: Option<&str>) -> Result<Vec<CoverageStatus>> {
        let conn = self.conn.lock();
        coverage::list_coverage(&conn, symbol, timeframe)
    }

    /// Read-modify-write of a coverage row under the connection lock
    pub fn update_coverage_with<F>(
        &self,
        symbol: &str,
        timeframe: &str,
        rows_written: i64,
        now: DateTime<Utc>,
        merge: F,
    ) -> Result<CoverageStatus>
    where
        F: FnOnce(Option<&CoverageStatus>) -> Option<(DateTime<Utc>, DateTime<Utc>)>,
    {
        let mut conn = self.conn.lock();
        coverage::extend_coverage(&mut conn, symbol, timeframe, rows_written, now, merge)
    }

    // ========== Settings Methods ==========

    pub fn get_settings(&self) -> Result<OrchestratorSettings> {
        let conn = self.conn.lock();
        settings::get_settings(&conn)
    }

    pub fn update_settings(&self, update: &SettingsUpdate) -> Result<OrchestratorSettings> {
        let conn = self.conn.lock();
        settings::update_settings(&conn, update)
    }

    pub fn get_policy(&self, job_type: JobType) -> Result<JobTypePolicy> {
        let conn = self.conn.lock();
        settings::get_policy(&conn, job_type)
    }

    pub fn list_policies(&self) -> Result<Vec<JobTypePolicy>> {
        let conn = self.conn.lock();
        settings::list_policies(&conn)
    }

    pub fn upsert_policy(&self, policy: &JobTypePolicy) -> Result<JobTypePolicy> {
        let conn = self.conn.lock();
        settings::upsert_policy(&conn, policy)
    }

    pub fn list_provider_routes(&self) -> Result<Vec<ProviderRoute>> {
        let conn = self.conn.lock();
        settings::list_provider_routes(&conn)
    }

    pub fn upsert_provider_route(&self, route: &ProviderRoute) -> Result<()> {
        let conn = self.conn.lock();
        settings::upsert_provider_route(&conn, route)
    }

    // ========== Market Calendar Methods ==========

    pub fn get_market_timing(&self, exchange: &str) -> Result<Option<MarketTiming>> {
        let conn = self.conn.lock();
        market::get_timing_by_exchange(&conn, exchange)
    }

    pub fn upsert_market_timing(
        &self,
        exchange: &str,
        timezone: &str,
        market_open: &str,
        market_close: &str,
    ) -> Result<MarketTiming> {
        let conn = self.conn.lock();
        market::upsert_timing(&conn, exchange, timezone, market_open, market_close)
    }

    pub fn get_market_holidays(&self, exchange: &str) -> Result<Vec<MarketHoliday>> {
        let conn = self.conn.lock();
        market::get_holidays_by_exchange(&conn, exchange)
    }

    pub fn create_market_holiday(&self, req: &CreateHolidayRequest) -> Result<MarketHoliday> {
        let conn = self.conn.lock();
        market::create_holiday(&conn, req)
    }

    pub fn delete_market_holiday(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        market::delete_holiday(&conn, id)
    }

    /// Build the trading calendar for an exchange from the market tables,
    /// falling back to the built-in US session when none is configured
    pub fn load_calendar(&self, exchange: &str) -> Result<TradingCalendar> {
        let conn = self.conn.lock();
        match market::get_timing_by_exchange(&conn, exchange)? {
            Some(timing) => {
                let holidays = market::get_holidays_by_exchange(&conn, exchange)?;
                TradingCalendar::from_records(&timing, &holidays)
            }
            None => {
                tracing::warn!("No market timing for {}, using US equities session", exchange);
                Ok(TradingCalendar::us_equities())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn test_on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.db");
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();

        {
            let db = SqliteDb::new(&path).unwrap();
            db.upsert_definition(
                &NewJobDefinition {
                    job_type: JobType::FetchIntraday,
                    symbol: "AAPL".to_string(),
                    timeframe: crate::market::Timeframe::H1,
                    window_days: 7,
                    slice_hours: None,
                    priority: None,
                    enabled: None,
                },
                24,
                now,
            )
            .unwrap();
        }

        // Migrations are idempotent on reopen
        let db = SqliteDb::new(&path).unwrap();
        assert_eq!(db.list_definitions().unwrap().len(), 1);
    }

    #[test]
    fn test_load_calendar_uses_seeded_holidays() {
        let db = SqliteDb::open_in_memory().unwrap();
        let calendar = db.load_calendar("US").unwrap();

        let thanksgiving = NaiveDate::from_ymd_opt(2026, 11, 26).unwrap();
        assert!(!calendar.is_trading_day(thanksgiving));
        assert!(calendar.is_trading_day(NaiveDate::from_ymd_opt(2026, 11, 25).unwrap()));

        // Unknown exchange falls back
        assert_eq!(db.load_calendar("XX").unwrap().exchange(), "US");
    }
}
