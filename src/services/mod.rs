//! Services Layer
//!
//! Business logic shared between the tick scheduler and the HTTP API.
//!
//! # Architecture
//!
//! ```text
//! Tick Scheduler ──┐
//!                  ├──> Services --> SQLite ledger / DuckDB bars / Providers
//! HTTP API ────────┘
//! ```
//!
//! # Services
//!
//! - `CalendarService` - Market session and holiday maintenance
//! - `CoverageService` - Gap detection and coverage merges
//! - `FetchWorker` - Claim and execute job runs
//! - `Orchestrator` - Tick, retry/watchdog, dispatch
//! - `EnsureCoverageService` - On-demand coverage requests
//! - `StatusService` - Operator status and listings

pub mod calendar_service;
pub mod coverage_service;
pub mod ensure_coverage_service;
pub mod orchestrator_service;
pub mod status_service;
pub mod worker_service;

pub use calendar_service::{CalendarService, CalendarView, SetTimingRequest};
pub use coverage_service::{CoverageService, Gap};
pub use ensure_coverage_service::{EnsureCoverageRequest, EnsureCoverageResponse, EnsureCoverageService, EnsureStatus};
pub use orchestrator_service::{Orchestrator, RetryReport, TickReport};
pub use status_service::{StatusReport, StatusService};
pub use worker_service::{FetchWorker, RunOutcome};
