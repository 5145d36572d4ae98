//! Application state management

use crate::db::duckdb::DuckDb;
use crate::db::sqlite::models::{JobType, JobTypePolicy, OrchestratorSettings};
use crate::db::sqlite::SqliteDb;
use crate::error::{AppError, Result};
use crate::feed::JobFeed;
use crate::market::TradingCalendar;
use crate::providers::rate_limiter::ProviderRateLimiter;
use crate::providers::ProviderRegistry;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;

/// Bootstrap configuration read from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding orchestrator.db and bars.duckdb
    pub data_dir: PathBuf,
    /// Lease holder id for this process
    pub instance_id: String,
}

impl AppConfig {
    /// `ORCHESTRATOR_DATA_DIR` (default `./data`) and
    /// `ORCHESTRATOR_INSTANCE_ID` (default a random `orchestrator-<uuid>`)
    pub fn from_env() -> Result<Self> {
        let data_dir = match std::env::var("ORCHESTRATOR_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            Ok(_) => {
                return Err(AppError::Config("ORCHESTRATOR_DATA_DIR is empty".to_string()));
            }
            Err(_) => PathBuf::from("data"),
        };

        let instance_id = std::env::var("ORCHESTRATOR_INSTANCE_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("orchestrator-{}", uuid::Uuid::new_v4()));

        Ok(Self { data_dir, instance_id })
    }
}

/// Source of "now" for every scheduling decision
#[derive(Debug)]
pub enum Clock {
    System,
    /// Fixed time that only moves when told to
    Manual(Mutex<DateTime<Utc>>),
}

impl Clock {
    pub fn manual(start: DateTime<Utc>) -> Self {
        Clock::Manual(Mutex::new(start))
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Manual(ts) => *ts.lock(),
        }
    }

    /// Move a manual clock to `ts`; no-op for the system clock
    pub fn set(&self, ts: DateTime<Utc>) {
        if let Clock::Manual(current) = self {
            *current.lock() = ts;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(current) = self {
            let mut guard = current.lock();
            *guard += by;
        }
    }
}

/// Application state shared across the scheduler, workers and API
pub struct AppState {
    /// SQLite database connection
    pub sqlite: Arc<SqliteDb>,

    /// DuckDB connection for bars
    pub duckdb: Arc<DuckDb>,

    /// Job type -> provider routing
    providers: RwLock<Arc<ProviderRegistry>>,

    /// Per-provider token buckets
    pub rate_limiter: Arc<ProviderRateLimiter>,

    /// Realtime job run events
    pub feed: JobFeed,

    pub clock: Arc<Clock>,

    /// Lease holder id for this process
    pub instance_id: String,

    /// Application data directory (None for in-memory state)
    pub data_dir: Option<PathBuf>,
}

impl AppState {
    /// Create new application state
    pub fn new(config: &AppConfig) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&config.data_dir)?;

        tracing::info!("Data directory: {:?}", config.data_dir);

        // Initialize SQLite database
        let sqlite_path = config.data_dir.join("orchestrator.db");
        let sqlite = Arc::new(SqliteDb::new(&sqlite_path)?);

        // Initialize DuckDB for bars
        let duckdb_path = config.data_dir.join("bars.duckdb");
        let duckdb = Arc::new(DuckDb::new(&duckdb_path)?);

        let state = Self {
            sqlite,
            duckdb,
            providers: RwLock::new(Arc::new(ProviderRegistry::new())),
            rate_limiter: Arc::new(ProviderRateLimiter::new()),
            feed: JobFeed::default(),
            clock: Arc::new(Clock::System),
            instance_id: config.instance_id.clone(),
            data_dir: Some(config.data_dir.clone()),
        };
        state.reload_providers()?;

        Ok(state)
    }

    /// Fully in-memory state driven by the given clock and providers
    pub fn in_memory(clock: Arc<Clock>, providers: ProviderRegistry) -> Result<Self> {
        Ok(Self {
            sqlite: Arc::new(SqliteDb::open_in_memory()?),
            duckdb: Arc::new(DuckDb::open_in_memory()?),
            providers: RwLock::new(Arc::new(providers)),
            rate_limiter: Arc::new(ProviderRateLimiter::new()),
            feed: JobFeed::default(),
            clock,
            instance_id: format!("orchestrator-{}", uuid::Uuid::new_v4()),
            data_dir: None,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn settings(&self) -> Result<OrchestratorSettings> {
        self.sqlite.get_settings()
    }

    pub fn policy(&self, job_type: JobType) -> Result<JobTypePolicy> {
        self.sqlite.get_policy(job_type)
    }

    /// Trading calendar for the configured exchange
    pub fn calendar(&self) -> Result<TradingCalendar> {
        let settings = self.settings()?;
        self.sqlite.load_calendar(&settings.calendar_exchange)
    }

    pub fn providers(&self) -> Arc<ProviderRegistry> {
        self.providers.read().clone()
    }

    pub fn set_providers(&self, registry: ProviderRegistry) {
        *self.providers.write() = Arc::new(registry);
    }

    /// Rebuild the provider registry from the persisted routing table
    pub fn reload_providers(&self) -> Result<()> {
        let routes = self.sqlite.list_provider_routes()?;
        let registry = ProviderRegistry::from_routes(&routes)?;
        tracing::info!("Loaded {} provider routes", routes.len());
        self.set_providers(registry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock() {
        let start = Utc.with_ymd_and_hms(2026, 10, 15, 14, 0, 0).unwrap();
        let clock = Clock::manual(start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_on_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: dir.path().join("nested"),
            instance_id: "orchestrator-test".to_string(),
        };

        let state = AppState::new(&config).unwrap();
        assert!(config.data_dir.join("orchestrator.db").exists());
        assert_eq!(state.settings().unwrap().max_concurrent_jobs, 4);
        assert!(state.providers().routes().is_empty());
        assert_eq!(state.calendar().unwrap().exchange(), "US");
    }
}
