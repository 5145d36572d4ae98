//! DuckDB data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRow {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Stored bar count and span for one (symbol, timeframe, provider)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSummary {
    pub provider: String,
    pub bar_count: i64,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
}
