//! Application error types

use crate::providers::ProviderError;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Advisory lease contended, or a run was reclaimed from under its worker
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, also recorded on failed job runs
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::DuckDb(_) => "DUCKDB_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Provider(e) => e.code(),
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Concurrency(_) => "CONCURRENCY_ERROR",
            AppError::InvalidTransition(_) => "INVALID_TRANSITION",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Storage-level failures that abort a tick
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::DuckDb(_) | AppError::Io(_) | AppError::Internal(_)
        )
    }
}

/// Serializable error response for API clients
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(err: AppError) -> Self {
        ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_code_passes_through() {
        let err = AppError::from(ProviderError::RateLimited { retry_after: None });
        assert_eq!(err.code(), "RATE_LIMITED");
        assert!(!err.is_system());
    }

    #[test]
    fn test_error_response_carries_code() {
        let response = ErrorResponse::from(AppError::Concurrency("lease held".to_string()));
        assert_eq!(response.code, "CONCURRENCY_ERROR");
        assert!(response.message.contains("lease held"));
    }
}
