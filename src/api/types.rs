//! HTTP API request/response types

use crate::error::AppError;
use crate::market::Timeframe;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard response envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success_with_message(message: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.to_string()),
            code: None,
            data: None,
        }
    }

    pub fn success_with_data(data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: None,
            code: None,
            data: Some(data),
        }
    }

    pub fn error(err: &AppError) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(err.to_string()),
            code: Some(err.code().to_string()),
            data: None,
        }
    }
}

/// HTTP status for an application error
pub fn status_code(err: &AppError) -> StatusCode {
    match err {
        AppError::Validation(_) | AppError::Serialization(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Concurrency(_) | AppError::InvalidTransition(_) => StatusCode::CONFLICT,
        AppError::Provider(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Empty data type for responses without data
#[derive(Debug, Serialize, Deserialize)]
pub struct Empty {}

/// Optional (symbol, timeframe) narrowing shared by the listing endpoints
#[derive(Debug, Default, Deserialize)]
pub struct PairQuery {
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
}

/// GET /api/v1/status
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_hours() -> i64 {
    24
}

/// GET /api/v1/runs
#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /api/v1/bars
#[derive(Debug, Deserialize)]
pub struct BarsQuery {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// POST /api/v1/definitions/:id/enabled
#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}
