//! Coverage Service
//!
//! Gap detection against the persisted coverage range, the monotonic
//! coverage merge, and slicing of gaps into job-sized pieces.

use crate::db::sqlite::job_definitions::MAX_WINDOW_DAYS;
use crate::db::sqlite::models::CoverageStatus;
use crate::error::{AppError, Result};
use crate::market::{Timeframe, TradingCalendar};
use crate::state::AppState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Uncovered range of bar timestamps, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Gap {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn bar_count(&self, timeframe: Timeframe) -> i64 {
        let bar = timeframe.bar_duration().num_seconds().max(1);
        (self.end - self.start).num_seconds() / bar + 1
    }
}

/// Desired window for a definition: `window_days` worth of bars ending at
/// the bar containing `now`. `window_days` is clamped to
/// `1..=MAX_WINDOW_DAYS` so rows written before that bound still schedule.
pub fn coverage_window(timeframe: Timeframe, window_days: i64, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let window_end = timeframe.floor(now);
    let window_start = window_end - Duration::days(window_days.clamp(1, MAX_WINDOW_DAYS)) + timeframe.bar_duration();
    (window_start, window_end)
}

/// Uncovered sub-intervals of the window.
///
/// Pure in its inputs. A side of the window only counts as a gap when the
/// trading time it spans reaches the timeframe's staleness threshold, so
/// closed-market stretches and freshly written ranges never show up.
pub fn compute_gaps(
    coverage: Option<&CoverageStatus>,
    timeframe: Timeframe,
    window_days: i64,
    now: DateTime<Utc>,
    calendar: &TradingCalendar,
) -> Vec<Gap> {
    let (window_start, window_end) = coverage_window(timeframe, window_days, now);
    let bar = timeframe.bar_duration();
    let threshold = timeframe.staleness_threshold();

    let Some((from, to)) = coverage.and_then(|c| c.range()) else {
        return vec![Gap::new(window_start, window_end)];
    };

    let mut gaps = Vec::with_capacity(2);

    // Before the covered range
    if from > window_start {
        let end = (from - bar).min(window_end);
        if end >= window_start && calendar.trading_duration_between(window_start, from.min(window_end + bar)) >= threshold {
            gaps.push(Gap::new(window_start, end));
        }
    }

    // After the covered range
    if to < window_end {
        let start = (to + bar).max(window_start);
        if start <= window_end && calendar.trading_duration_between(start, now) >= threshold {
            gaps.push(Gap::new(start, window_end));
        }
    }

    gaps
}

/// Merge a freshly written range into the existing one.
///
/// Returns the widened range when the two overlap, touch within one bar,
/// or are separated only by non-trading time; `None` when they are
/// disjoint and the row must stay as it is.
pub fn merge_range(
    existing: Option<(DateTime<Utc>, DateTime<Utc>)>,
    new: (DateTime<Utc>, DateTime<Utc>),
    timeframe: Timeframe,
    calendar: &TradingCalendar,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (a, b) = new;
    let Some((from, to)) = existing else {
        return Some((a, b));
    };
    let bar = timeframe.bar_duration();

    let adjacent = a <= to + bar && b >= from - bar;
    let bridged_after = a > to + bar && !calendar.has_trading_time(to + bar, a);
    let bridged_before = b < from - bar && !calendar.has_trading_time(b + bar, from);

    if adjacent || bridged_after || bridged_before {
        Some((from.min(a), to.max(b)))
    } else {
        None
    }
}

/// Cut gaps into slices of at most `max_slice_hours`, oldest first
pub fn slice_gaps(gaps: &[Gap], timeframe: Timeframe, max_slice_hours: i64) -> Vec<Gap> {
    let bar = timeframe.bar_duration();
    let max_slice = Duration::hours(max_slice_hours.max(1)).max(bar);

    let mut ordered: Vec<Gap> = gaps.to_vec();
    ordered.sort_by_key(|g| g.start);

    let mut slices = Vec::new();
    for gap in ordered {
        let mut cursor = gap.start;
        while cursor <= gap.end {
            let end = (cursor + max_slice - bar).min(gap.end);
            slices.push(Gap::new(cursor, end));
            cursor = end + bar;
        }
    }
    slices
}

/// Coverage service for business logic
pub struct CoverageService;

impl CoverageService {
    /// Gaps for a pair as of the state clock
    pub fn get_coverage_gaps(
        state: &AppState,
        symbol: &str,
        timeframe: Timeframe,
        window_days: i64,
    ) -> Result<Vec<Gap>> {
        Self::get_coverage_gaps_at(state, symbol, timeframe, window_days, state.now())
    }

    /// Gaps for a pair as of `now`
    pub fn get_coverage_gaps_at(
        state: &AppState,
        symbol: &str,
        timeframe: Timeframe,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Gap>> {
        if window_days <= 0 {
            return Err(AppError::Validation(format!(
                "window_days must be positive, got {}",
                window_days
            )));
        }
        let calendar = state.calendar()?;
        let coverage = state.sqlite.get_coverage(symbol, timeframe.as_str())?;
        let gaps = compute_gaps(coverage.as_ref(), timeframe, window_days, now, &calendar);

        debug!(
            "CoverageService::get_coverage_gaps - {} {} window {}d: {} gaps",
            symbol,
            timeframe,
            window_days,
            gaps.len()
        );
        Ok(gaps)
    }

    /// Record that bars covering `[start, end]` were written
    pub fn extend_coverage(
        state: &AppState,
        calendar: &TradingCalendar,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        rows_written: i64,
    ) -> Result<CoverageStatus> {
        let now = state.now();
        let updated = state.sqlite.update_coverage_with(
            symbol,
            timeframe.as_str(),
            rows_written,
            now,
            |current| {
                let existing = current.and_then(|c| c.range());
                let merged = merge_range(existing, (start, end), timeframe, calendar);
                if merged.is_none() {
                    debug!(
                        "CoverageService::extend_coverage - {} {} [{}, {}] disjoint from {:?}, left unchanged",
                        symbol, timeframe, start, end, existing
                    );
                }
                merged
            },
        )?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calendar() -> TradingCalendar {
        TradingCalendar::us_equities()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn coverage(from: DateTime<Utc>, to: DateTime<Utc>) -> CoverageStatus {
        CoverageStatus {
            symbol: "AAPL".to_string(),
            timeframe: Timeframe::H1,
            from_ts: Some(from),
            to_ts: Some(to),
            last_success_at: Some(to),
            last_rows_written: 1,
            updated_at: to,
        }
    }

    #[test]
    fn test_window_is_exact_bar_count() {
        let now = utc(2026, 10, 16, 15, 20);
        let (start, end) = coverage_window(Timeframe::H1, 7, now);
        assert_eq!(end, utc(2026, 10, 16, 15, 0));
        assert_eq!(Gap::new(start, end).bar_count(Timeframe::H1), 168);
    }

    #[test]
    fn test_window_clamps_oversized_days() {
        let now = utc(2026, 10, 16, 15, 20);
        assert_eq!(
            coverage_window(Timeframe::H1, 200_000_000, now),
            coverage_window(Timeframe::H1, MAX_WINDOW_DAYS, now)
        );
        assert_eq!(coverage_window(Timeframe::H1, 0, now), coverage_window(Timeframe::H1, 1, now));
    }

    #[test]
    fn test_no_coverage_is_one_gap() {
        let now = utc(2026, 10, 16, 15, 20);
        let gaps = compute_gaps(None, Timeframe::H1, 7, now, &calendar());
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].end, utc(2026, 10, 16, 15, 0));
    }

    #[test]
    fn test_gaps_are_idempotent() {
        let now = utc(2026, 10, 16, 18, 10);
        let cov = coverage(utc(2026, 10, 13, 13, 0), utc(2026, 10, 15, 19, 0));
        let first = compute_gaps(Some(&cov), Timeframe::H1, 7, now, &calendar());
        let second = compute_gaps(Some(&cov), Timeframe::H1, 7, now, &calendar());
        assert_eq!(first, second);
    }

    #[test]
    fn test_partial_coverage_yields_only_the_tail() {
        // Covered Tue 13:00 through Wed 19:00 UTC; now Fri 18:10 UTC (14:10 NY)
        let now = utc(2026, 10, 16, 18, 10);
        let cov = coverage(utc(2026, 10, 13, 13, 0), utc(2026, 10, 14, 19, 0));
        let gaps = compute_gaps(Some(&cov), Timeframe::H1, 3, now, &calendar());

        // Window starts inside the covered range, so only the tail is missing
        assert_eq!(gaps, vec![Gap::new(utc(2026, 10, 14, 20, 0), utc(2026, 10, 16, 18, 0))]);
    }

    #[test]
    fn test_recent_write_is_not_stale() {
        // Last covered bar 17:00, now 18:40: only 40 minutes of bar 18:00 elapsed
        let now = utc(2026, 10, 16, 18, 40);
        let cov = coverage(utc(2026, 10, 9, 19, 0), utc(2026, 10, 16, 17, 0));
        assert!(compute_gaps(Some(&cov), Timeframe::H1, 7, now, &calendar()).is_empty());
    }

    #[test]
    fn test_closed_market_is_not_a_gap() {
        // Friday close covered; Saturday midday the weekend is not missing data
        let now = utc(2026, 10, 17, 16, 0);
        let cov = coverage(utc(2026, 10, 10, 16, 0), utc(2026, 10, 16, 19, 0));
        assert!(compute_gaps(Some(&cov), Timeframe::H1, 7, now, &calendar()).is_empty());
    }

    #[test]
    fn test_merge_rules() {
        let cal = calendar();
        let tf = Timeframe::H1;
        let existing = Some((utc(2026, 10, 14, 13, 0), utc(2026, 10, 14, 16, 0)));

        // Touching within one bar
        assert_eq!(
            merge_range(existing, (utc(2026, 10, 14, 17, 0), utc(2026, 10, 14, 19, 0)), tf, &cal),
            Some((utc(2026, 10, 14, 13, 0), utc(2026, 10, 14, 19, 0)))
        );
        // Inside the existing range never shrinks it
        assert_eq!(
            merge_range(existing, (utc(2026, 10, 14, 14, 0), utc(2026, 10, 14, 15, 0)), tf, &cal),
            existing
        );
        // Disjoint with trading time in between
        assert_eq!(
            merge_range(existing, (utc(2026, 10, 14, 19, 0), utc(2026, 10, 14, 19, 0)), tf, &cal),
            None
        );
        // Bridged by the overnight close: Wed 19:00 -> Thu 13:00
        let evening = Some((utc(2026, 10, 14, 13, 0), utc(2026, 10, 14, 19, 0)));
        assert_eq!(
            merge_range(evening, (utc(2026, 10, 15, 13, 0), utc(2026, 10, 15, 15, 0)), tf, &cal),
            Some((utc(2026, 10, 14, 13, 0), utc(2026, 10, 15, 15, 0)))
        );
    }

    #[test]
    fn test_slicing_is_oldest_first_and_bounded() {
        let tf = Timeframe::H1;
        let gaps = vec![
            Gap::new(utc(2026, 10, 15, 0, 0), utc(2026, 10, 15, 9, 0)),
            Gap::new(utc(2026, 10, 13, 0, 0), utc(2026, 10, 13, 3, 0)),
        ];
        let slices = slice_gaps(&gaps, tf, 4);

        assert_eq!(slices[0], Gap::new(utc(2026, 10, 13, 0, 0), utc(2026, 10, 13, 3, 0)));
        assert_eq!(slices[1], Gap::new(utc(2026, 10, 15, 0, 0), utc(2026, 10, 15, 3, 0)));
        assert_eq!(slices[2], Gap::new(utc(2026, 10, 15, 4, 0), utc(2026, 10, 15, 7, 0)));
        assert_eq!(slices[3], Gap::new(utc(2026, 10, 15, 8, 0), utc(2026, 10, 15, 9, 0)));
        assert_eq!(slices.len(), 4);
        for slice in &slices {
            assert!(slice.bar_count(tf) <= 4);
        }
    }
}
