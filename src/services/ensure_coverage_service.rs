//! Ensure-Coverage Service
//!
//! On-demand entry point for callers that need a pair's bars now. Upserts
//! the definition, enqueues boosted runs for any gaps and returns without
//! waiting on a fetch.

use crate::db::sqlite::models::{CoverageStatus, NewJobDefinition, TriggerSource};
use crate::error::{AppError, Result};
use crate::market::Timeframe;
use crate::services::coverage_service::{slice_gaps, CoverageService, Gap};
use crate::services::orchestrator_service::enqueue_gaps;
use crate::state::AppState;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use crate::db::sqlite::job_definitions::MAX_WINDOW_DAYS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureStatus {
    CoverageComplete,
    GapsDetected,
}

/// Ensure coverage request
#[derive(Debug, Clone, Deserialize)]
pub struct EnsureCoverageRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub window_days: i64,
}

/// Ensure coverage response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureCoverageResponse {
    pub status: EnsureStatus,
    pub job_def_id: i64,
    pub coverage_status: Option<CoverageStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub gaps: Vec<Gap>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub enqueued_run_ids: Vec<i64>,
    pub retrying: bool,
}

/// Ensure-coverage service for business logic
pub struct EnsureCoverageService;

impl EnsureCoverageService {
    pub fn ensure_coverage(
        state: &AppState,
        holder_id: &str,
        request: &EnsureCoverageRequest,
    ) -> Result<EnsureCoverageResponse> {
        let symbol = request.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(AppError::Validation("Symbol is required".to_string()));
        }
        if request.window_days <= 0 || request.window_days > MAX_WINDOW_DAYS {
            return Err(AppError::Validation(format!(
                "window_days must be within 1..={}, got {}",
                MAX_WINDOW_DAYS, request.window_days
            )));
        }

        let now = state.now();
        let settings = state.settings()?;
        let job_type = request.timeframe.default_job_type();
        let policy = state.policy(job_type)?;

        let def = state.sqlite.upsert_definition(
            &NewJobDefinition {
                job_type,
                symbol: symbol.clone(),
                timeframe: request.timeframe,
                window_days: request.window_days,
                slice_hours: None,
                priority: None,
                enabled: Some(true),
            },
            policy.max_slice_hours,
            now,
        )?;

        // Gaps for the requested window, not the definition's widest one
        let gaps = CoverageService::get_coverage_gaps_at(state, &symbol, request.timeframe, request.window_days, now)?;
        if gaps.is_empty() {
            return Ok(EnsureCoverageResponse {
                status: EnsureStatus::CoverageComplete,
                job_def_id: def.id,
                coverage_status: state.sqlite.get_coverage(&symbol, request.timeframe.as_str())?,
                gaps,
                enqueued_run_ids: Vec::new(),
                retrying: false,
            });
        }

        let lease_ttl = Duration::seconds(settings.lease_ttl_secs.max(1));
        let (enqueued_run_ids, retrying) = match state.sqlite.acquire_lease(def.id, holder_id, lease_ttl, now) {
            Ok(()) => {
                let mut budget = policy.max_slices_per_tick;
                let enqueued = enqueue_gaps(
                    state,
                    &def,
                    &policy,
                    &gaps,
                    &mut budget,
                    def.priority + settings.ensure_priority_boost,
                    TriggerSource::EnsureCoverage,
                    now,
                );
                state.sqlite.release_lease(def.id, holder_id)?;
                let outcome = enqueued?;
                (
                    outcome.created.iter().map(|r| r.id).collect::<Vec<_>>(),
                    outcome.dedup_skips > 0,
                )
            }
            Err(AppError::Concurrency(msg)) => {
                // Another scheduler is enqueuing this pair right now
                warn!("EnsureCoverageService::ensure_coverage - {} {}: {}", symbol, request.timeframe, msg);
                let max_slice_hours = def.slice_hours.min(policy.max_slice_hours).max(1);
                let mut overlapping = false;
                for slice in slice_gaps(&gaps, request.timeframe, max_slice_hours) {
                    if state
                        .sqlite
                        .has_overlapping_run(&symbol, request.timeframe.as_str(), slice.start, slice.end)?
                    {
                        overlapping = true;
                        break;
                    }
                }
                (Vec::new(), overlapping)
            }
            Err(e) => return Err(e),
        };

        info!(
            "EnsureCoverageService::ensure_coverage - {} {} {}d: {} gaps, {} runs enqueued, retrying={}",
            symbol,
            request.timeframe,
            request.window_days,
            gaps.len(),
            enqueued_run_ids.len(),
            retrying
        );

        Ok(EnsureCoverageResponse {
            status: EnsureStatus::GapsDetected,
            job_def_id: def.id,
            coverage_status: state.sqlite.get_coverage(&symbol, request.timeframe.as_str())?,
            gaps,
            enqueued_run_ids,
            retrying,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::models::{JobStatus, JobType};
    use crate::providers::ProviderRegistry;
    use crate::state::Clock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn state() -> AppState {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 15, 20, 0).unwrap();
        AppState::in_memory(Arc::new(Clock::manual(now)), ProviderRegistry::new()).unwrap()
    }

    fn request(symbol: &str, window_days: i64) -> EnsureCoverageRequest {
        EnsureCoverageRequest {
            symbol: symbol.to_string(),
            timeframe: Timeframe::H1,
            window_days,
        }
    }

    #[test]
    fn test_rejects_bad_input() {
        let state = state();
        assert!(EnsureCoverageService::ensure_coverage(&state, "a", &request(" ", 3)).is_err());
        assert!(EnsureCoverageService::ensure_coverage(&state, "a", &request("AAPL", 0)).is_err());
        assert!(state.sqlite.list_definitions().unwrap().is_empty());
    }

    #[test]
    fn test_enqueues_boosted_runs_then_reports_retrying() {
        let state = state();

        let first = EnsureCoverageService::ensure_coverage(&state, "a", &request("aapl", 2)).unwrap();
        assert_eq!(first.status, EnsureStatus::GapsDetected);
        assert_eq!(first.gaps.len(), 1);
        assert_eq!(first.enqueued_run_ids.len(), 2);
        assert!(!first.retrying);

        let run = state.sqlite.get_run(first.enqueued_run_ids[0]).unwrap().unwrap();
        assert_eq!(run.status, JobStatus::Queued);
        assert_eq!(run.priority, 100);
        assert_eq!(run.symbol, "AAPL");
        assert_eq!(run.job_type, JobType::FetchIntraday);

        let second = EnsureCoverageService::ensure_coverage(&state, "a", &request("AAPL", 2)).unwrap();
        assert_eq!(second.job_def_id, first.job_def_id);
        assert!(second.enqueued_run_ids.is_empty());
        assert!(second.retrying);
    }

    #[test]
    fn test_complete_when_covered() {
        let state = state();
        let calendar = state.calendar().unwrap();
        let now = state.now();
        let start = now - Duration::days(10);
        CoverageService::extend_coverage(&state, &calendar, "AAPL", Timeframe::H1, start, Timeframe::H1.floor(now), 10)
            .unwrap();

        let response = EnsureCoverageService::ensure_coverage(&state, "a", &request("AAPL", 7)).unwrap();
        assert_eq!(response.status, EnsureStatus::CoverageComplete);
        assert!(response.coverage_status.is_some());
        assert!(response.gaps.is_empty());
    }
}
