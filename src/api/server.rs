//! HTTP server for the ops API, ensure-coverage gateway and realtime feed

use crate::api::handlers::{self, ApiState};
use crate::error::{AppError, Result};
use crate::services::Orchestrator;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the router with all routes
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = Arc::new(ApiState::new(orchestrator));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ================================================================
        // Health check
        // ================================================================
        .route("/health", get(handlers::health_check))
        .route("/", get(handlers::health_check))

        // ================================================================
        // Orchestration
        // ================================================================
        .route("/api/v1/tick", post(handlers::tick))
        .route("/api/v1/retry", post(handlers::retry))
        .route("/api/v1/dispatch", post(handlers::dispatch))
        .route("/api/v1/ensure-coverage", post(handlers::ensure_coverage))

        // ================================================================
        // Observability
        // ================================================================
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/runs", get(handlers::recent_runs))
        .route("/api/v1/coverage", get(handlers::coverage))
        .route("/api/v1/bars", get(handlers::bars))
        .route("/api/v1/feed", get(handlers::feed))

        // ================================================================
        // Job definitions
        // ================================================================
        .route(
            "/api/v1/definitions",
            get(handlers::list_definitions).post(handlers::upsert_definition),
        )
        .route("/api/v1/definitions/:id/enabled", post(handlers::set_definition_enabled))

        // ================================================================
        // Market calendar
        // ================================================================
        .route("/api/v1/calendars/:exchange", get(handlers::get_calendar))
        .route("/api/v1/calendars/:exchange/timing", post(handlers::set_calendar_timing))
        .route("/api/v1/holidays", post(handlers::add_holiday))
        .route("/api/v1/holidays/:id", delete(handlers::delete_holiday))

        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server manager
pub struct ApiServer {
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ApiServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            shutdown_tx: None,
        }
    }

    /// Bind and serve in the background. Returns the bound address, which
    /// differs from the requested one when port 0 is given.
    pub async fn start(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid API address {}:{}: {}", host, port, e)))?;

        let app = router(self.orchestrator.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("API server shutting down");
            });

            if let Err(e) = server.await {
                error!("API server error: {}", e);
            }
        });

        info!("Market orchestrator API listening on http://{}", bound);
        info!("  GET  /health");
        info!("  POST /api/v1/tick | /api/v1/retry | /api/v1/dispatch | /api/v1/ensure-coverage");
        info!("  GET  /api/v1/status | /api/v1/runs | /api/v1/coverage | /api/v1/bars | /api/v1/feed");
        info!("  GET|POST /api/v1/definitions, POST /api/v1/definitions/:id/enabled");
        info!("  GET  /api/v1/calendars/:exchange, POST /api/v1/calendars/:exchange/timing");
        info!("  POST /api/v1/holidays, DELETE /api/v1/holidays/:id");

        Ok(bound)
    }

    /// Stop the server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            info!("API server stop signal sent");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop();
    }
}
