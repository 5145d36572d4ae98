//! SQLite database models

use crate::error::{AppError, Result};
use crate::market::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of ingestion work a definition describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FetchIntraday,
    FetchHistorical,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::FetchIntraday, JobType::FetchHistorical];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FetchIntraday => "fetch_intraday",
            JobType::FetchHistorical => "fetch_historical",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fetch_intraday" => Ok(JobType::FetchIntraday),
            "fetch_historical" => Ok(JobType::FetchHistorical),
            other => Err(AppError::Validation(format!("Unknown job type: {}", other))),
        }
    }
}

/// JobRun lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    /// Allowed edges of the run state machine.
    ///
    /// queued -> running -> {success, failed}; failed -> queued (retry);
    /// running -> queued (watchdog). Nothing leaves success.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Queued)
                | (JobStatus::Failed, JobStatus::Queued)
        )
    }

    pub fn ensure_transition(&self, next: JobStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::InvalidTransition(format!("{} -> {}", self, next)))
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(AppError::Validation(format!("Unknown job status: {}", other))),
        }
    }
}

/// What caused a run to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Tick,
    EnsureCoverage,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Tick => "tick",
            TriggerSource::EnsureCoverage => "ensure_coverage",
        }
    }
}

impl FromStr for TriggerSource {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tick" => Ok(TriggerSource::Tick),
            "ensure_coverage" => Ok(TriggerSource::EnsureCoverage),
            other => Err(AppError::Validation(format!("Unknown trigger: {}", other))),
        }
    }
}

/// Template describing a (symbol, timeframe) pair to keep fresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: i64,
    pub job_type: JobType,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub window_days: i64,
    pub slice_hours: i64,
    pub priority: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert/upsert payload for a definition
#[derive(Debug, Clone, Deserialize)]
pub struct NewJobDefinition {
    pub job_type: JobType,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub window_days: i64,
    pub slice_hours: Option<i64>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
}

/// Known-good contiguous bar range for one (symbol, timeframe)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageStatus {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from_ts: Option<DateTime<Utc>>,
    pub to_ts: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_rows_written: i64,
    pub updated_at: DateTime<Utc>,
}

impl CoverageStatus {
    pub fn range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.from_ts, self.to_ts) {
            (Some(from), Some(to)) => Some((from, to)),
            _ => None,
        }
    }
}

/// One dispatched slice of ingestion work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: i64,
    pub job_definition_id: i64,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub job_type: JobType,
    pub slice_start: DateTime<Utc>,
    pub slice_end: DateTime<Utc>,
    pub status: JobStatus,
    pub attempt: i64,
    pub max_attempts: i64,
    pub priority: i64,
    pub triggered_by: TriggerSource,
    pub provider: Option<String>,
    pub rows_written: i64,
    pub progress_percent: f64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRun {
    /// Failed with no attempts left; needs operator attention
    pub fn is_exhausted(&self) -> bool {
        self.status == JobStatus::Failed && self.attempt >= self.max_attempts
    }

    /// Status as reported to operators, including `failed-exhausted`
    pub fn reported_status(&self) -> &'static str {
        if self.is_exhausted() {
            "failed-exhausted"
        } else {
            self.status.as_str()
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Insert payload for a queued run
#[derive(Debug, Clone)]
pub struct NewJobRun {
    pub job_definition_id: i64,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub job_type: JobType,
    pub slice_start: DateTime<Utc>,
    pub slice_end: DateTime<Utc>,
    pub max_attempts: i64,
    pub priority: i64,
    pub triggered_by: TriggerSource,
}

/// Global orchestrator settings (single row)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub max_concurrent_jobs: i64,
    pub tick_interval_secs: u64,
    pub lease_ttl_secs: i64,
    pub ensure_priority_boost: i64,
    pub backoff_jitter_pct: f64,
    pub scheduler_enabled: bool,
    pub api_enabled: bool,
    pub api_host: String,
    pub api_port: u16,
    pub calendar_exchange: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            tick_interval_secs: 60,
            lease_ttl_secs: 120,
            ensure_priority_boost: 100,
            backoff_jitter_pct: 0.2,
            scheduler_enabled: true,
            api_enabled: true,
            api_host: "127.0.0.1".to_string(),
            api_port: 5780,
            calendar_exchange: "US".to_string(),
        }
    }
}

/// Per job type scheduling and retry limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTypePolicy {
    pub job_type: JobType,
    pub max_slice_hours: i64,
    pub max_slices_per_tick: i64,
    pub max_attempts: i64,
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,
    pub run_timeout_secs: i64,
}

impl JobTypePolicy {
    pub fn default_for(job_type: JobType) -> Self {
        match job_type {
            JobType::FetchIntraday => Self {
                job_type,
                max_slice_hours: 24,
                max_slices_per_tick: 10,
                max_attempts: 3,
                backoff_base_secs: 30,
                backoff_max_secs: 900,
                run_timeout_secs: 600,
            },
            JobType::FetchHistorical => Self {
                job_type,
                max_slice_hours: 720,
                max_slices_per_tick: 5,
                max_attempts: 5,
                backoff_base_secs: 60,
                backoff_max_secs: 3600,
                run_timeout_secs: 1800,
            },
        }
    }
}

/// Routing entry: which provider serves a job type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRoute {
    pub job_type: JobType,
    pub provider_name: String,
    pub base_url: String,
    pub rate_per_second: u32,
    pub max_bars_per_request: i64,
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Success));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Success.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Success));
        assert!(Queued.ensure_transition(Success).is_err());
    }

    #[test]
    fn test_status_and_job_type_parse() {
        for status in [JobStatus::Queued, JobStatus::Running, JobStatus::Success, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str().parse::<JobType>().unwrap(), job_type);
        }
    }
}
