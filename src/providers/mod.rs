//! Market data provider adapters
//!
//! A provider serves OHLCV bars for a time range. Providers are routed by
//! job type through `ProviderRegistry`, so the fetch worker never names a
//! vendor directly.

pub mod http;
pub mod rate_limiter;
pub mod types;

use crate::db::sqlite::models::{JobType, ProviderRoute};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
pub use types::{BarRequest, ProviderBar};

/// Failure reported by a provider call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("No data: {0}")]
    NoData(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl ProviderError {
    /// Stable error code recorded on the failed run
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "RATE_LIMITED",
            ProviderError::Timeout(_) => "TIMEOUT",
            ProviderError::NoData(_) => "NO_DATA",
            ProviderError::AuthFailed(_) => "AUTH_FAILED",
            ProviderError::Unavailable(_) => "PROVIDER_UNAVAILABLE",
            ProviderError::Upstream(_) => "UPSTREAM_ERROR",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ProviderError::Upstream(format!("Malformed response: {}", err))
        } else {
            ProviderError::Upstream(err.to_string())
        }
    }
}

/// Provider trait that all bar sources must implement
#[async_trait]
pub trait BarProvider: Send + Sync {
    /// Provider name, recorded on job runs and bars
    fn name(&self) -> &str;

    /// Largest page the provider serves in one call
    fn max_bars_per_request(&self) -> i64;

    /// Sustained request rate allowed by the provider
    fn rate_per_second(&self) -> u32;

    /// Per-call deadline
    fn timeout(&self) -> Duration;

    /// Fetch bars with open time in `[request.start, request.end]`
    async fn fetch_bars(&self, request: &BarRequest) -> Result<Vec<ProviderBar>, ProviderError>;
}

/// Job type to provider routing table
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn BarProvider>>,
    routes: HashMap<JobType, String>,
}

impl ProviderRegistry {
    /// Empty registry; every job type is unrouted
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP providers for the persisted routing table
    pub fn from_routes(routes: &[ProviderRoute]) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        for route in routes {
            let provider = http::HttpBarProvider::from_route(route)?;
            registry = registry.with_route(route.job_type, Arc::new(provider));
        }
        Ok(registry)
    }

    /// Register a provider and route a job type to it
    pub fn with_route(mut self, job_type: JobType, provider: Arc<dyn BarProvider>) -> Self {
        let name = provider.name().to_string();
        self.providers.insert(name.clone(), provider);
        self.routes.insert(job_type, name);
        self
    }

    /// Provider serving a job type
    pub fn route(&self, job_type: JobType) -> Result<Arc<dyn BarProvider>, ProviderError> {
        self.routes
            .get(&job_type)
            .and_then(|name| self.providers.get(name))
            .cloned()
            .ok_or_else(|| ProviderError::Unavailable(format!("No provider routed for {}", job_type)))
    }

    /// Get provider by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn BarProvider>> {
        self.providers.get(name).cloned()
    }

    /// (job type, provider name) pairs
    pub fn routes(&self) -> Vec<(JobType, String)> {
        let mut routes: Vec<(JobType, String)> =
            self.routes.iter().map(|(jt, name)| (*jt, name.clone())).collect();
        routes.sort();
        routes
    }
}
