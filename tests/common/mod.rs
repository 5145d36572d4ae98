//! Shared fixtures for orchestrator integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use market_orchestrator::db::sqlite::models::JobType;
use market_orchestrator::providers::{BarProvider, BarRequest, ProviderBar, ProviderError, ProviderRegistry};
use market_orchestrator::services::Orchestrator;
use market_orchestrator::state::{AppState, Clock};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the provider does on its next call
#[derive(Debug, Clone)]
pub enum Step {
    /// One bar for every bar-aligned timestamp in the page
    Serve,
    /// Nothing at all
    Empty,
    Fail(ProviderError),
}

/// In-memory provider that follows a script, then serves every call
pub struct ScriptedProvider {
    name: String,
    max_bars: i64,
    delay: Option<Duration>,
    script: Mutex<VecDeque<Step>>,
    otherwise: Step,
    requests: Mutex<Vec<BarRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_bars: 1000,
            delay: None,
            script: Mutex::new(VecDeque::new()),
            otherwise: Step::Serve,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn max_bars(mut self, max_bars: i64) -> Self {
        self.max_bars = max_bars;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a step for the next unscripted call
    pub fn then(self, step: Step) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Behaviour once the script runs out
    pub fn otherwise(mut self, step: Step) -> Self {
        self.otherwise = step;
        self
    }

    pub fn requests(&self) -> Vec<BarRequest> {
        self.requests.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub fn bars_for(request: &BarRequest) -> Vec<ProviderBar> {
    let bar = request.timeframe.bar_duration();
    let mut bars = Vec::new();
    let mut ts = request.start;
    while ts <= request.end {
        bars.push(ProviderBar {
            ts,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1_000.0,
        });
        ts += bar;
    }
    bars
}

#[async_trait]
impl BarProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_bars_per_request(&self) -> i64 {
        self.max_bars
    }

    fn rate_per_second(&self) -> u32 {
        10_000
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn fetch_bars(&self, request: &BarRequest) -> Result<Vec<ProviderBar>, ProviderError> {
        self.requests.lock().push(request.clone());
        let step = self.script.lock().pop_front().unwrap_or_else(|| self.otherwise.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step {
            Step::Serve => Ok(bars_for(request)),
            Step::Empty => Ok(Vec::new()),
            Step::Fail(err) => Err(err),
        }
    }
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// In-memory state on a manual clock with `provider` serving both job types
pub fn setup(now: DateTime<Utc>, provider: Arc<ScriptedProvider>) -> (Arc<AppState>, Arc<Clock>) {
    let clock = Arc::new(Clock::manual(now));
    let registry = ProviderRegistry::new()
        .with_route(JobType::FetchIntraday, provider.clone())
        .with_route(JobType::FetchHistorical, provider);
    let state = Arc::new(AppState::in_memory(clock.clone(), registry).unwrap());
    (state, clock)
}

pub fn orchestrator(state: &Arc<AppState>, instance_id: &str) -> Orchestrator {
    Orchestrator::with_instance_id(state.clone(), instance_id)
}
