//! Status Service
//!
//! Read-only operator view over the run ledger, coverage table and stored
//! bars.

use crate::db::duckdb::models::{BarRow, BarSummary};
use crate::db::sqlite::job_stats::JobStats;
use crate::db::sqlite::models::{CoverageStatus, JobRun};
use crate::error::{AppError, Result};
use crate::market::Timeframe;
use crate::state::AppState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const MAX_RECENT_RUNS: i64 = 500;

/// Longest status lookback, ten years
const MAX_STATUS_HOURS: i64 = 24 * 365 * 10;

/// Most bars a single bar read may span
const MAX_BAR_QUERY: i64 = 10_000;

/// Aggregated orchestrator health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub since: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    #[serde(flatten)]
    pub stats: JobStats,
}

/// Coverage row with what is actually stored and what is still pending
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageReport {
    #[serde(flatten)]
    pub coverage: CoverageStatus,
    /// Stored bars per provider
    pub bars: Vec<BarSummary>,
    /// Failed runs for the pair with retry budget left
    pub retrying_run_ids: Vec<i64>,
}

/// Status service for business logic
pub struct StatusService;

impl StatusService {
    /// Run statistics over runs created in the last `hours`
    pub fn status(
        state: &AppState,
        symbol: Option<&str>,
        timeframe: Option<Timeframe>,
        hours: i64,
    ) -> Result<StatusReport> {
        if !(1..=MAX_STATUS_HOURS).contains(&hours) {
            return Err(AppError::Validation(format!(
                "hours must be within 1..={}, got {}",
                MAX_STATUS_HOURS, hours
            )));
        }
        let now = state.now();
        let since = now - Duration::hours(hours);
        let symbol = symbol.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty());

        let stats = state
            .sqlite
            .get_job_stats(since, symbol.as_deref(), timeframe.map(|tf| tf.as_str()))?;

        Ok(StatusReport {
            since,
            generated_at: now,
            symbol,
            timeframe,
            stats,
        })
    }

    /// Newest runs first
    pub fn recent_runs(
        state: &AppState,
        symbol: Option<&str>,
        timeframe: Option<Timeframe>,
        limit: i64,
    ) -> Result<Vec<JobRun>> {
        let symbol = symbol.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty());
        state.sqlite.list_recent_runs(
            symbol.as_deref(),
            timeframe.map(|tf| tf.as_str()),
            limit.clamp(1, MAX_RECENT_RUNS),
        )
    }

    pub fn coverage(state: &AppState, symbol: Option<&str>, timeframe: Option<Timeframe>) -> Result<Vec<CoverageReport>> {
        let symbol = symbol.map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty());
        let rows = state
            .sqlite
            .list_coverage(symbol.as_deref(), timeframe.map(|tf| tf.as_str()))?;

        let mut reports = Vec::with_capacity(rows.len());
        for coverage in rows {
            let tf = coverage.timeframe.as_str();
            let bars = state.duckdb.summarize(&coverage.symbol, tf)?;
            let retrying_run_ids = state
                .sqlite
                .list_retrying_runs(&coverage.symbol, tf)?
                .into_iter()
                .map(|run| run.id)
                .collect();
            reports.push(CoverageReport {
                coverage,
                bars,
                retrying_run_ids,
            });
        }
        Ok(reports)
    }

    /// Stored bars for a pair with open time in `[from, to]`
    pub fn bars(
        state: &AppState,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BarRow>> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(AppError::Validation("Symbol is required".to_string()));
        }
        if from > to {
            return Err(AppError::Validation(format!("from {} is after to {}", from, to)));
        }
        let span = (to - from).num_seconds() / timeframe.bar_duration().num_seconds().max(1) + 1;
        if span > MAX_BAR_QUERY {
            return Err(AppError::Validation(format!(
                "Range spans {} {} bars, at most {} allowed",
                span, timeframe, MAX_BAR_QUERY
            )));
        }
        state.duckdb.query_bars(&symbol, timeframe.as_str(), from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::models::{JobType, NewJobDefinition, NewJobRun, TriggerSource};
    use crate::providers::ProviderRegistry;
    use crate::services::coverage_service::CoverageService;
    use crate::state::Clock;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn test_status_counts_recent_runs() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 15, 20, 0).unwrap();
        let state = AppState::in_memory(Arc::new(Clock::manual(now)), ProviderRegistry::new()).unwrap();

        let def = state
            .sqlite
            .upsert_definition(
                &NewJobDefinition {
                    job_type: JobType::FetchIntraday,
                    symbol: "AAPL".to_string(),
                    timeframe: Timeframe::H1,
                    window_days: 1,
                    slice_hours: None,
                    priority: None,
                    enabled: None,
                },
                24,
                now,
            )
            .unwrap();
        let start = Utc.with_ymd_and_hms(2026, 10, 15, 13, 0, 0).unwrap();
        state
            .sqlite
            .enqueue_run(
                &NewJobRun {
                    job_definition_id: def.id,
                    symbol: "AAPL".to_string(),
                    timeframe: Timeframe::H1,
                    job_type: JobType::FetchIntraday,
                    slice_start: start,
                    slice_end: start + Duration::hours(3),
                    max_attempts: 3,
                    priority: 0,
                    triggered_by: TriggerSource::Tick,
                },
                now,
            )
            .unwrap();

        let report = StatusService::status(&state, Some("aapl"), None, 24).unwrap();
        assert_eq!(report.symbol.as_deref(), Some("AAPL"));
        assert_eq!(report.stats.total_runs, 1);
        assert_eq!(report.stats.queued, 1);

        assert_eq!(StatusService::recent_runs(&state, None, Some(Timeframe::H1), 10).unwrap().len(), 1);
        assert!(StatusService::recent_runs(&state, None, Some(Timeframe::M5), 10).unwrap().is_empty());
        assert!(StatusService::status(&state, None, None, 0).is_err());
        let err = StatusService::status(&state, None, None, i64::MAX).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(StatusService::status(&state, None, None, MAX_STATUS_HOURS).is_ok());
        assert!(StatusService::coverage(&state, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_coverage_report_includes_bars_and_retries() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 15, 20, 0).unwrap();
        let state = AppState::in_memory(Arc::new(Clock::manual(now)), ProviderRegistry::new()).unwrap();
        let calendar = state.calendar().unwrap();
        let start = Utc.with_ymd_and_hms(2026, 10, 15, 14, 0, 0).unwrap();

        let bars: Vec<BarRow> = (0..3)
            .map(|i| BarRow {
                ts: start + Duration::hours(i),
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.5,
                volume: 100.0,
            })
            .collect();
        state.duckdb.upsert_bars("AAPL", "1h", "scripted", &bars).unwrap();
        CoverageService::extend_coverage(&state, &calendar, "AAPL", Timeframe::H1, start, start + Duration::hours(2), 3)
            .unwrap();

        let def = state
            .sqlite
            .upsert_definition(
                &NewJobDefinition {
                    job_type: JobType::FetchIntraday,
                    symbol: "AAPL".to_string(),
                    timeframe: Timeframe::H1,
                    window_days: 1,
                    slice_hours: None,
                    priority: None,
                    enabled: None,
                },
                24,
                now,
            )
            .unwrap();
        let run = state
            .sqlite
            .enqueue_run(
                &NewJobRun {
                    job_definition_id: def.id,
                    symbol: "AAPL".to_string(),
                    timeframe: Timeframe::H1,
                    job_type: JobType::FetchIntraday,
                    slice_start: start + Duration::hours(3),
                    slice_end: start + Duration::hours(5),
                    max_attempts: 3,
                    priority: 0,
                    triggered_by: TriggerSource::Tick,
                },
                now,
            )
            .unwrap()
            .unwrap();
        let claimed = state.sqlite.claim_next_run(4, now).unwrap().unwrap();
        assert_eq!(claimed.id, run.id);
        state
            .sqlite
            .mark_run_failed(run.id, 1, 0, "TIMEOUT", "slow", Some(now + Duration::minutes(1)), now)
            .unwrap();

        let reports = StatusService::coverage(&state, Some("aapl"), None).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].bars[0].bar_count, 3);
        assert_eq!(reports[0].bars[0].provider, "scripted");
        assert_eq!(reports[0].retrying_run_ids, vec![run.id]);

        let read = StatusService::bars(&state, "aapl", Timeframe::H1, start, start + Duration::hours(1)).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0], bars[0]);

        let backwards = StatusService::bars(&state, "AAPL", Timeframe::H1, start, start - Duration::hours(1));
        assert_eq!(backwards.unwrap_err().code(), "VALIDATION_ERROR");
        let too_wide = StatusService::bars(&state, "AAPL", Timeframe::M1, start, start + Duration::days(30));
        assert_eq!(too_wide.unwrap_err().code(), "VALIDATION_ERROR");
    }
}
