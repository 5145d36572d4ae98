//! Orchestrator Service
//!
//! Turns job definitions into queued runs and queued runs into running
//! workers. `tick` scans definitions under their leases, `retry_failed`
//! requeues backed-off failures and recovers stuck runs, `dispatch` claims
//! queued runs up to the global concurrency cap.

use crate::db::sqlite::models::{
    JobDefinition, JobRun, JobStatus, JobType, JobTypePolicy, NewJobRun, TriggerSource,
};
use crate::error::{AppError, Result};
use crate::services::coverage_service::{slice_gaps, CoverageService, Gap};
use crate::services::worker_service::{FetchWorker, RunOutcome};
use crate::state::AppState;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Summary of one scheduling tick
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub definitions_scanned: usize,
    pub gaps_found: usize,
    pub runs_created: Vec<i64>,
    pub dedup_skips: usize,
    pub lease_skips: usize,
    pub budget_skips: usize,
    pub dispatched: Vec<i64>,
}

/// Summary of one retry pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryReport {
    pub requeued: Vec<i64>,
    pub watchdog_requeued: Vec<i64>,
    pub watchdog_failed: Vec<i64>,
    pub leases_purged: usize,
}

/// Result of turning one definition's gaps into queued runs
#[derive(Debug, Clone, Default)]
pub struct EnqueueOutcome {
    pub created: Vec<JobRun>,
    pub dedup_skips: usize,
    pub budget_skips: usize,
}

/// Slice `gaps` oldest-first and enqueue each slice unless an overlapping
/// active run exists. Every created run consumes one unit of `budget`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn enqueue_gaps(
    state: &AppState,
    def: &JobDefinition,
    policy: &JobTypePolicy,
    gaps: &[Gap],
    budget: &mut i64,
    priority: i64,
    triggered_by: TriggerSource,
    now: DateTime<Utc>,
) -> Result<EnqueueOutcome> {
    let max_slice_hours = def.slice_hours.min(policy.max_slice_hours).max(1);
    let slices = slice_gaps(gaps, def.timeframe, max_slice_hours);

    let mut outcome = EnqueueOutcome::default();
    for (idx, slice) in slices.iter().enumerate() {
        if *budget <= 0 {
            outcome.budget_skips += slices.len() - idx;
            break;
        }

        let new_run = NewJobRun {
            job_definition_id: def.id,
            symbol: def.symbol.clone(),
            timeframe: def.timeframe,
            job_type: def.job_type,
            slice_start: slice.start,
            slice_end: slice.end,
            max_attempts: policy.max_attempts,
            priority,
            triggered_by,
        };

        match state.sqlite.enqueue_run(&new_run, now)? {
            Some(run) => {
                *budget -= 1;
                state.feed.publish(None, &run, now);
                outcome.created.push(run);
            }
            None => {
                debug!(
                    "Orchestrator - {} {} [{} .. {}] overlaps an active run",
                    def.symbol, def.timeframe, slice.start, slice.end
                );
                outcome.dedup_skips += 1;
            }
        }
    }

    Ok(outcome)
}

/// Scheduling core shared by the tick loop and the HTTP API
pub struct Orchestrator {
    state: Arc<AppState>,
    instance_id: String,
    workers: Mutex<Vec<JoinHandle<Option<RunOutcome>>>>,
}

impl Orchestrator {
    pub fn new(state: Arc<AppState>) -> Self {
        let instance_id = state.instance_id.clone();
        Self::with_instance_id(state, instance_id)
    }

    /// Orchestrator holding leases under a specific holder id
    pub fn with_instance_id(state: Arc<AppState>, instance_id: impl Into<String>) -> Self {
        Self {
            state,
            instance_id: instance_id.into(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Scan every enabled definition, enqueue slices for its gaps and
    /// dispatch queued runs.
    pub fn tick(&self) -> Result<TickReport> {
        let state = &self.state;
        let now = state.now();
        let settings = state.settings()?;
        let lease_ttl = Duration::seconds(settings.lease_ttl_secs.max(1));

        let definitions = state.sqlite.list_enabled_definitions()?;
        let mut report = TickReport {
            definitions_scanned: definitions.len(),
            ..Default::default()
        };

        let mut policies: HashMap<JobType, JobTypePolicy> = HashMap::new();
        let mut budgets: HashMap<JobType, i64> = HashMap::new();

        for def in &definitions {
            if !policies.contains_key(&def.job_type) {
                let policy = state.policy(def.job_type)?;
                budgets.insert(def.job_type, policy.max_slices_per_tick);
                policies.insert(def.job_type, policy);
            }
            let (Some(policy), Some(budget)) = (policies.get(&def.job_type), budgets.get_mut(&def.job_type))
            else {
                continue;
            };

            match state.sqlite.acquire_lease(def.id, &self.instance_id, lease_ttl, now) {
                Ok(()) => {}
                Err(AppError::Concurrency(msg)) => {
                    debug!("Orchestrator::tick - skipping definition {}: {}", def.id, msg);
                    report.lease_skips += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let scanned = Self::scan_definition(state, def, policy, budget, now);
            state.sqlite.release_lease(def.id, &self.instance_id)?;
            let (gaps, outcome) = scanned?;

            report.gaps_found += gaps;
            report.dedup_skips += outcome.dedup_skips;
            report.budget_skips += outcome.budget_skips;
            report.runs_created.extend(outcome.created.iter().map(|r| r.id));
        }

        report.dispatched = self.dispatch()?;

        if !report.runs_created.is_empty() || !report.dispatched.is_empty() {
            info!(
                "Orchestrator::tick - {} definitions, {} gaps, {} runs created, {} dispatched ({} dedup, {} lease, {} budget skips)",
                report.definitions_scanned,
                report.gaps_found,
                report.runs_created.len(),
                report.dispatched.len(),
                report.dedup_skips,
                report.lease_skips,
                report.budget_skips
            );
        }

        Ok(report)
    }

    fn scan_definition(
        state: &AppState,
        def: &JobDefinition,
        policy: &JobTypePolicy,
        budget: &mut i64,
        now: DateTime<Utc>,
    ) -> Result<(usize, EnqueueOutcome)> {
        let gaps = CoverageService::get_coverage_gaps_at(state, &def.symbol, def.timeframe, def.window_days, now)?;
        if gaps.is_empty() {
            return Ok((0, EnqueueOutcome::default()));
        }
        let outcome = enqueue_gaps(state, def, policy, &gaps, budget, def.priority, TriggerSource::Tick, now)?;
        Ok((gaps.len(), outcome))
    }

    /// Claim queued runs up to the concurrency cap and spawn a worker for
    /// each. Does not wait for the workers.
    pub fn dispatch(&self) -> Result<Vec<i64>> {
        let mut dispatched = Vec::new();
        let mut workers = self.workers.lock();
        workers.retain(|handle| !handle.is_finished());

        while let Some(run) = FetchWorker::claim_next(&self.state)? {
            dispatched.push(run.id);
            workers.push(tokio::spawn(FetchWorker::run(self.state.clone(), run)));
        }

        Ok(dispatched)
    }

    /// Wait for every worker spawned so far and collect what they reported
    pub async fn wait_for_workers(&self) -> Vec<RunOutcome> {
        let handles: Vec<JoinHandle<Option<RunOutcome>>> = std::mem::take(&mut *self.workers.lock());

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => warn!("Orchestrator::wait_for_workers - worker task failed: {}", e),
            }
        }
        outcomes
    }

    /// Requeue failed runs whose backoff elapsed, then recover runs stuck
    /// in `running` past their job type's timeout.
    pub fn retry_failed(&self) -> Result<RetryReport> {
        let state = &self.state;
        let now = state.now();
        let mut report = RetryReport::default();

        for run in state.sqlite.requeue_eligible_failed(now)? {
            state.feed.publish(Some(JobStatus::Failed), &run, now);
            report.requeued.push(run.id);
        }

        let mut timeouts: HashMap<JobType, Duration> = HashMap::new();
        for run in state.sqlite.list_running_runs()? {
            let timeout = match timeouts.get(&run.job_type) {
                Some(timeout) => *timeout,
                None => {
                    let timeout = Duration::seconds(state.policy(run.job_type)?.run_timeout_secs.max(1));
                    timeouts.insert(run.job_type, timeout);
                    timeout
                }
            };

            let started = run.started_at.unwrap_or(run.updated_at);
            if now - started <= timeout {
                continue;
            }

            let message = format!(
                "Run exceeded {}s timeout on attempt {}",
                timeout.num_seconds(),
                run.attempt
            );
            let Some(recovered) = state.sqlite.recover_stale_run(&run, "WATCHDOG_TIMEOUT", &message, now)? else {
                continue;
            };

            warn!(
                "Orchestrator::retry_failed - watchdog moved run {} {} {} to {}",
                recovered.id,
                recovered.symbol,
                recovered.timeframe,
                recovered.reported_status()
            );
            state.feed.publish(Some(JobStatus::Running), &recovered, now);
            match recovered.status {
                JobStatus::Queued => report.watchdog_requeued.push(recovered.id),
                _ => report.watchdog_failed.push(recovered.id),
            }
        }

        report.leases_purged = state.sqlite.purge_expired_leases(now)?;

        if !report.requeued.is_empty() || !report.watchdog_requeued.is_empty() || !report.watchdog_failed.is_empty() {
            info!(
                "Orchestrator::retry_failed - {} requeued, watchdog {} requeued / {} failed",
                report.requeued.len(),
                report.watchdog_requeued.len(),
                report.watchdog_failed.len()
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::models::NewJobDefinition;
    use crate::market::Timeframe;
    use crate::providers::ProviderRegistry;
    use crate::state::Clock;
    use chrono::TimeZone;

    fn state_at(now: DateTime<Utc>) -> Arc<AppState> {
        Arc::new(AppState::in_memory(Arc::new(Clock::manual(now)), ProviderRegistry::new()).unwrap())
    }

    fn define(state: &AppState, symbol: &str, window_days: i64, priority: i64) -> JobDefinition {
        state
            .sqlite
            .upsert_definition(
                &NewJobDefinition {
                    job_type: JobType::FetchIntraday,
                    symbol: symbol.to_string(),
                    timeframe: Timeframe::H1,
                    window_days,
                    slice_hours: None,
                    priority: Some(priority),
                    enabled: None,
                },
                24,
                state.now(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_enqueues_and_dedupes() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 15, 20, 0).unwrap();
        let state = state_at(now);
        define(&state, "AAPL", 3, 0);

        let orchestrator = Orchestrator::with_instance_id(state.clone(), "a");
        let first = orchestrator.tick().unwrap();
        assert_eq!(first.definitions_scanned, 1);
        assert_eq!(first.gaps_found, 1);
        // 3 days of hourly bars in 24h slices
        assert_eq!(first.runs_created.len(), 3);
        // No worker has run yet, so all three are still running
        assert_eq!(first.dispatched.len(), 3);

        let second = orchestrator.tick().unwrap();
        assert!(second.runs_created.is_empty());
        assert_eq!(second.dedup_skips, 3);
    }

    #[tokio::test]
    async fn test_tick_skips_contended_definition() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 15, 20, 0).unwrap();
        let state = state_at(now);
        let def = define(&state, "AAPL", 3, 0);
        state
            .sqlite
            .acquire_lease(def.id, "other", Duration::seconds(120), now)
            .unwrap();

        let report = Orchestrator::with_instance_id(state.clone(), "a").tick().unwrap();
        assert_eq!(report.lease_skips, 1);
        assert!(report.runs_created.is_empty());
    }

    #[tokio::test]
    async fn test_budget_shared_across_definitions() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 15, 20, 0).unwrap();
        let state = state_at(now);
        let mut policy = state.policy(JobType::FetchIntraday).unwrap();
        policy.max_slices_per_tick = 4;
        state.sqlite.upsert_policy(&policy).unwrap();

        define(&state, "AAPL", 3, 10);
        define(&state, "MSFT", 3, 0);

        let report = Orchestrator::with_instance_id(state.clone(), "a").tick().unwrap();
        assert_eq!(report.runs_created.len(), 4);
        assert_eq!(report.budget_skips, 2);

        let aapl = state.sqlite.list_recent_runs(Some("AAPL"), None, 10).unwrap();
        assert_eq!(aapl.len(), 3);
    }
}
