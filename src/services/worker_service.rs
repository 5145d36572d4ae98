//! Fetch Worker Service
//!
//! Claims queued runs and executes them: page through the slice, fetch
//! from the routed provider under its rate limit and timeout, validate,
//! upsert bars, extend coverage, and report progress on the ledger.

use crate::db::duckdb::models::BarRow;
use crate::db::sqlite::models::{JobRun, JobStatus};
use crate::error::{AppError, Result};
use crate::providers::{BarRequest, ProviderBar, ProviderError};
use crate::scheduler::backoff::BackoffPolicy;
use crate::services::coverage_service::{CoverageService, Gap};
use crate::state::AppState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How a worker left a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: i64,
    pub attempt: i64,
    pub status: JobStatus,
    pub rows_written: i64,
    pub error_code: Option<String>,
}

/// Failure that ends an attempt and is recorded on the run
#[derive(Debug)]
struct AttemptFailure {
    code: String,
    message: String,
    retry_after: Option<std::time::Duration>,
}

impl From<ProviderError> for AttemptFailure {
    fn from(err: ProviderError) -> Self {
        let retry_after = match &err {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retry_after,
        }
    }
}

/// Sort by timestamp, then keep the longest valid prefix.
///
/// A bar is valid when every value is finite, high/low bound open and close,
/// volume is non-negative and the timestamp falls inside `[start, end]`.
/// Duplicate timestamps keep the first occurrence. Returns the valid bars
/// and the reason the first invalid bar was rejected, if any.
pub fn validate_bars(
    mut bars: Vec<ProviderBar>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> (Vec<BarRow>, Option<String>) {
    bars.sort_by_key(|b| b.ts);

    let mut valid: Vec<BarRow> = Vec::with_capacity(bars.len());
    for bar in bars {
        if valid.last().map_or(false, |prev| prev.ts == bar.ts) {
            continue;
        }

        let values = [bar.open, bar.high, bar.low, bar.close, bar.volume];
        let problem = if values.iter().any(|v| !v.is_finite()) {
            Some("non-finite value")
        } else if bar.high < bar.open.max(bar.close).max(bar.low) {
            Some("high below open/close/low")
        } else if bar.low > bar.open.min(bar.close) {
            Some("low above open/close")
        } else if bar.volume < 0.0 {
            Some("negative volume")
        } else if bar.ts < start || bar.ts > end {
            Some("timestamp outside requested range")
        } else {
            None
        };

        if let Some(problem) = problem {
            return (valid, Some(format!("Invalid bar at {}: {}", bar.ts, problem)));
        }

        valid.push(BarRow {
            ts: bar.ts,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        });
    }

    (valid, None)
}

/// Fetch worker for business logic
pub struct FetchWorker;

impl FetchWorker {
    /// Claim the next queued run if the concurrency cap allows
    pub fn claim_next(state: &AppState) -> Result<Option<JobRun>> {
        let settings = state.settings()?;
        let now = state.now();

        let claimed = state.sqlite.claim_next_run(settings.max_concurrent_jobs, now)?;
        if let Some(run) = &claimed {
            info!(
                "FetchWorker::claim_next - run {} {} {} [{} .. {}] attempt {}",
                run.id, run.symbol, run.timeframe, run.slice_start, run.slice_end, run.attempt
            );
            state.feed.publish(Some(JobStatus::Queued), run, now);
        }
        Ok(claimed)
    }

    /// Execute a claimed run to completion, recording any failure on the run.
    ///
    /// Returns `None` when the run could not be finalised because it was
    /// reclaimed, or storage failed; the watchdog recovers the latter.
    pub async fn run(state: Arc<AppState>, run: JobRun) -> Option<RunOutcome> {
        match Self::execute(&state, &run).await {
            Ok(outcome) => Some(outcome),
            Err(AppError::Concurrency(msg)) => {
                warn!("FetchWorker::run - run {} superseded: {}", run.id, msg);
                None
            }
            Err(e) => {
                error!("FetchWorker::run - run {} aborted: {}", run.id, e);
                let failure = AttemptFailure {
                    code: e.code().to_string(),
                    message: e.to_string(),
                    retry_after: None,
                };
                let rows_written = state
                    .sqlite
                    .get_run(run.id)
                    .ok()
                    .flatten()
                    .map_or(0, |current| current.rows_written);
                match Self::fail(&state, &run, failure, rows_written) {
                    Ok(outcome) => Some(outcome),
                    Err(inner) => {
                        error!("FetchWorker::run - could not record failure for run {}: {}", run.id, inner);
                        None
                    }
                }
            }
        }
    }

    /// Execute a claimed run. Provider and validation failures are recorded
    /// on the run and returned as a failed outcome; storage failures and
    /// lost claims are returned as errors.
    pub async fn execute(state: &AppState, run: &JobRun) -> Result<RunOutcome> {
        if run.status != JobStatus::Running {
            return Err(AppError::InvalidTransition(format!(
                "Run {} is {}, not running",
                run.id, run.status
            )));
        }

        let provider = match state.providers().route(run.job_type) {
            Ok(provider) => provider,
            Err(e) => return Self::fail(state, run, e.into(), 0),
        };
        let provider_name = provider.name().to_string();

        if !state.sqlite.set_run_provider(run.id, run.attempt, &provider_name, state.now())? {
            return Err(Self::lost_claim(run));
        }

        let calendar = state.calendar()?;
        let timeframe = run.timeframe;
        let bar = timeframe.bar_duration();
        let page_span = Duration::seconds(bar.num_seconds() * provider.max_bars_per_request().max(1));
        let total_bars = Gap::new(run.slice_start, run.slice_end).bar_count(timeframe).max(1);

        // Resume after bars an earlier attempt already covered
        let fetch_start = match state
            .sqlite
            .get_coverage(&run.symbol, timeframe.as_str())?
            .and_then(|c| c.range())
        {
            Some((from, to)) if from <= run.slice_start && to >= run.slice_start => to + bar,
            _ => run.slice_start,
        };
        if fetch_start > run.slice_start {
            debug!(
                "FetchWorker::execute - run {} resuming at {} (covered through {})",
                run.id,
                fetch_start,
                fetch_start - bar
            );
        }

        let mut rows_written: i64 = 0;
        let mut cursor = fetch_start;

        while cursor <= run.slice_end {
            let page_end = (cursor + page_span - bar).min(run.slice_end);
            let request = BarRequest {
                symbol: run.symbol.clone(),
                timeframe,
                start: cursor,
                end: page_end,
            };

            state
                .rate_limiter
                .acquire(&provider_name, provider.rate_per_second())
                .await;

            let fetched = match tokio::time::timeout(provider.timeout(), provider.fetch_bars(&request)).await {
                Ok(Ok(bars)) => bars,
                Ok(Err(e)) => return Self::fail(state, run, e.into(), rows_written),
                Err(_) => {
                    let err = ProviderError::Timeout(provider.timeout());
                    return Self::fail(state, run, err.into(), rows_written);
                }
            };

            let fetched_count = fetched.len();
            let (valid, rejection) = validate_bars(fetched, cursor, page_end);

            if !valid.is_empty() {
                let written =
                    state
                        .duckdb
                        .upsert_bars(&run.symbol, timeframe.as_str(), &provider_name, &valid)? as i64;
                rows_written += written;
            }

            if let Some(reason) = rejection {
                // Coverage only over the bars that made it in
                if let Some(last) = valid.last() {
                    CoverageService::extend_coverage(
                        state,
                        &calendar,
                        &run.symbol,
                        timeframe,
                        cursor,
                        last.ts,
                        rows_written,
                    )?;
                }
                let failure = AttemptFailure {
                    code: "VALIDATION_ERROR".to_string(),
                    message: reason,
                    retry_after: None,
                };
                return Self::fail(state, run, failure, rows_written);
            }

            if !valid.is_empty() || !calendar.has_trading_time(cursor, page_end + bar) {
                CoverageService::extend_coverage(
                    state,
                    &calendar,
                    &run.symbol,
                    timeframe,
                    cursor,
                    page_end,
                    rows_written,
                )?;
            }

            let processed = Gap::new(run.slice_start, page_end).bar_count(timeframe);
            let progress = (processed as f64 / total_bars as f64 * 100.0).min(100.0);
            Self::report_progress(state, run, rows_written, progress)?;

            debug!(
                "FetchWorker::execute - run {} page [{} .. {}]: {} fetched, {} written",
                run.id,
                cursor,
                page_end,
                fetched_count,
                valid.len()
            );

            cursor = page_end + bar;
        }

        if rows_written == 0
            && fetch_start <= run.slice_end
            && calendar.has_trading_time(fetch_start, run.slice_end + bar)
        {
            let err = ProviderError::NoData(format!(
                "{} {} returned no bars for [{}, {}]",
                run.symbol, timeframe, fetch_start, run.slice_end
            ));
            return Self::fail(state, run, err.into(), 0);
        }

        CoverageService::extend_coverage(
            state,
            &calendar,
            &run.symbol,
            timeframe,
            run.slice_start,
            run.slice_end,
            rows_written,
        )?;

        let now = state.now();
        if !state.sqlite.mark_run_success(run.id, run.attempt, rows_written, now)? {
            return Err(Self::lost_claim(run));
        }
        Self::publish(state, run.id, JobStatus::Running, now)?;

        info!(
            "FetchWorker::execute - run {} {} {} succeeded, {} rows",
            run.id, run.symbol, timeframe, rows_written
        );

        Ok(RunOutcome {
            run_id: run.id,
            attempt: run.attempt,
            status: JobStatus::Success,
            rows_written,
            error_code: None,
        })
    }

    fn report_progress(state: &AppState, run: &JobRun, rows_written: i64, progress: f64) -> Result<()> {
        let now = state.now();
        if !state
            .sqlite
            .update_run_progress(run.id, run.attempt, rows_written, progress, now)?
        {
            return Err(Self::lost_claim(run));
        }
        Self::publish(state, run.id, JobStatus::Running, now)
    }

    /// running -> failed with backoff, or terminal when attempts are spent
    fn fail(state: &AppState, run: &JobRun, failure: AttemptFailure, rows_written: i64) -> Result<RunOutcome> {
        let now = state.now();
        let policy = state.policy(run.job_type)?;
        let settings = state.settings()?;

        let next_eligible_at = if run.attempt < run.max_attempts {
            let backoff = BackoffPolicy::for_job_type(&policy, settings.backoff_jitter_pct);
            let mut delay = backoff.next_delay(run.attempt);
            if let Some(retry_after) = failure.retry_after {
                delay = delay.max(retry_after);
            }
            let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(policy.backoff_max_secs));
            Some(now + delay)
        } else {
            None
        };

        if !state.sqlite.mark_run_failed(
            run.id,
            run.attempt,
            rows_written,
            &failure.code,
            &failure.message,
            next_eligible_at,
            now,
        )? {
            return Err(Self::lost_claim(run));
        }
        Self::publish(state, run.id, JobStatus::Running, now)?;

        warn!(
            "FetchWorker::execute - run {} {} {} attempt {}/{} failed: {} {}",
            run.id, run.symbol, run.timeframe, run.attempt, run.max_attempts, failure.code, failure.message
        );

        Ok(RunOutcome {
            run_id: run.id,
            attempt: run.attempt,
            status: JobStatus::Failed,
            rows_written,
            error_code: Some(failure.code),
        })
    }

    fn publish(state: &AppState, run_id: i64, previous: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if let Some(updated) = state.sqlite.get_run(run_id)? {
            state.feed.publish(Some(previous), &updated, now);
        }
        Ok(())
    }

    fn lost_claim(run: &JobRun) -> AppError {
        AppError::Concurrency(format!(
            "Run {} attempt {} is no longer running under this worker",
            run.id, run.attempt
        ))
    }
}
