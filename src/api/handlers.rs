//! HTTP API endpoint handlers

use crate::api::types::*;
use crate::db::sqlite::market::CreateHolidayRequest;
use crate::db::sqlite::models::NewJobDefinition;
use crate::error::{AppError, Result};
use crate::feed::FeedFilter;
use crate::services::{
    CalendarService, EnsureCoverageRequest, EnsureCoverageService, Orchestrator, SetTimingRequest, StatusService,
};
use axum::{
    extract::{Json, Path, Query, State as AxumState},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info};

/// Shared state for API handlers
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

fn respond<T: Serialize>(result: Result<T>) -> (StatusCode, Json<ApiResponse<T>>) {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success_with_data(data))),
        Err(e) => {
            if e.is_system() {
                error!("API request failed: {}", e);
            }
            (status_code(&e), Json(ApiResponse::error(&e)))
        }
    }
}

/// Run ledger work on the blocking pool; its cost grows with the number of
/// definitions and runs
async fn on_blocking_pool<T, F>(orchestrator: Arc<Orchestrator>, f: F) -> Result<T>
where
    F: FnOnce(&Orchestrator) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&orchestrator))
        .await
        .map_err(|e| AppError::Internal(format!("Blocking task failed: {}", e)))?
}

// ============================================================================
// Health Check
// ============================================================================

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::<Empty>::success_with_message("Market orchestrator is running"))
}

// ============================================================================
// Orchestration
// ============================================================================

/// POST /api/v1/tick
pub async fn tick(AxumState(state): AxumState<Arc<ApiState>>) -> impl IntoResponse {
    respond(on_blocking_pool(state.orchestrator.clone(), |o| o.tick()).await)
}

/// POST /api/v1/retry
pub async fn retry(AxumState(state): AxumState<Arc<ApiState>>) -> impl IntoResponse {
    respond(on_blocking_pool(state.orchestrator.clone(), |o| o.retry_failed()).await)
}

/// POST /api/v1/dispatch
pub async fn dispatch(AxumState(state): AxumState<Arc<ApiState>>) -> impl IntoResponse {
    respond(on_blocking_pool(state.orchestrator.clone(), |o| o.dispatch()).await)
}

/// POST /api/v1/ensure-coverage
///
/// Returns as soon as runs are enqueued; dispatch happens in the background.
pub async fn ensure_coverage(
    AxumState(state): AxumState<Arc<ApiState>>,
    Json(request): Json<EnsureCoverageRequest>,
) -> impl IntoResponse {
    let orchestrator = state.orchestrator.clone();
    let result = EnsureCoverageService::ensure_coverage(orchestrator.state(), orchestrator.instance_id(), &request);

    if matches!(&result, Ok(response) if !response.enqueued_run_ids.is_empty()) {
        tokio::spawn(async move {
            match orchestrator.dispatch() {
                Ok(ids) if !ids.is_empty() => info!("ensure-coverage dispatched runs {:?}", ids),
                Ok(_) => {}
                Err(e) => error!("ensure-coverage dispatch failed: {}", e),
            }
        });
    }

    respond(result)
}

// ============================================================================
// Observability
// ============================================================================

/// GET /api/v1/status?symbol=&timeframe=&hours=
pub async fn status(
    AxumState(state): AxumState<Arc<ApiState>>,
    Query(query): Query<StatusQuery>,
) -> impl IntoResponse {
    respond(StatusService::status(
        state.orchestrator.state(),
        query.symbol.as_deref(),
        query.timeframe,
        query.hours,
    ))
}

/// GET /api/v1/runs?symbol=&timeframe=&limit=
pub async fn recent_runs(
    AxumState(state): AxumState<Arc<ApiState>>,
    Query(query): Query<RunsQuery>,
) -> impl IntoResponse {
    respond(StatusService::recent_runs(
        state.orchestrator.state(),
        query.symbol.as_deref(),
        query.timeframe,
        query.limit,
    ))
}

/// GET /api/v1/coverage?symbol=&timeframe=
pub async fn coverage(
    AxumState(state): AxumState<Arc<ApiState>>,
    Query(query): Query<PairQuery>,
) -> impl IntoResponse {
    respond(StatusService::coverage(
        state.orchestrator.state(),
        query.symbol.as_deref(),
        query.timeframe,
    ))
}

/// GET /api/v1/bars?symbol=&timeframe=&from=&to=
pub async fn bars(
    AxumState(state): AxumState<Arc<ApiState>>,
    Query(query): Query<BarsQuery>,
) -> impl IntoResponse {
    respond(StatusService::bars(
        state.orchestrator.state(),
        &query.symbol,
        query.timeframe,
        query.from,
        query.to,
    ))
}

/// GET /api/v1/feed?symbol=&timeframe=
///
/// Server-Sent Events stream of job run changes.
pub async fn feed(
    AxumState(state): AxumState<Arc<ApiState>>,
    Query(query): Query<PairQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let filter = FeedFilter {
        symbol: query.symbol,
        timeframe: query.timeframe,
    };
    let events = state
        .orchestrator
        .state()
        .feed
        .subscribe(filter)
        .into_stream()
        .map(|event| {
            let sse = Event::default()
                .event("job_run")
                .json_data(&event)
                .unwrap_or_else(|e| Event::default().comment(format!("unserializable event: {}", e)));
            Ok::<_, Infallible>(sse)
        });

    Sse::new(events).keep_alive(KeepAlive::default())
}

// ============================================================================
// Job Definitions
// ============================================================================

/// GET /api/v1/definitions
pub async fn list_definitions(AxumState(state): AxumState<Arc<ApiState>>) -> impl IntoResponse {
    respond(state.orchestrator.state().sqlite.list_definitions())
}

/// POST /api/v1/definitions
pub async fn upsert_definition(
    AxumState(state): AxumState<Arc<ApiState>>,
    Json(request): Json<NewJobDefinition>,
) -> impl IntoResponse {
    let app = state.orchestrator.state();
    let result = app.policy(request.job_type).and_then(|policy| {
        app.sqlite
            .upsert_definition(&request, policy.max_slice_hours, app.now())
    });
    if let Ok(def) = &result {
        info!("Upserted job definition {} {} {}", def.id, def.symbol, def.timeframe);
    }
    respond(result)
}

/// POST /api/v1/definitions/:id/enabled
pub async fn set_definition_enabled(
    AxumState(state): AxumState<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(request): Json<SetEnabledRequest>,
) -> impl IntoResponse {
    let app = state.orchestrator.state();
    respond(app.sqlite.set_definition_enabled(id, request.enabled, app.now()))
}

// ============================================================================
// Market Calendar
// ============================================================================

/// GET /api/v1/calendars/:exchange
pub async fn get_calendar(
    AxumState(state): AxumState<Arc<ApiState>>,
    Path(exchange): Path<String>,
) -> impl IntoResponse {
    respond(CalendarService::get(state.orchestrator.state(), &exchange))
}

/// POST /api/v1/calendars/:exchange/timing
pub async fn set_calendar_timing(
    AxumState(state): AxumState<Arc<ApiState>>,
    Path(exchange): Path<String>,
    Json(request): Json<SetTimingRequest>,
) -> impl IntoResponse {
    respond(CalendarService::set_timing(state.orchestrator.state(), &exchange, &request))
}

/// POST /api/v1/holidays
pub async fn add_holiday(
    AxumState(state): AxumState<Arc<ApiState>>,
    Json(request): Json<CreateHolidayRequest>,
) -> impl IntoResponse {
    respond(CalendarService::add_holiday(state.orchestrator.state(), &request))
}

/// DELETE /api/v1/holidays/:id
pub async fn delete_holiday(
    AxumState(state): AxumState<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    respond(CalendarService::delete_holiday(state.orchestrator.state(), id).map(|_| Empty {}))
}
