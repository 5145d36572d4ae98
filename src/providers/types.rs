//! Provider request/response types

use crate::market::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page request: bars whose open time lies in `[start, end]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// OHLCV bar as returned by a provider, not yet validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderBar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// JSON body served by HTTP bar endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct BarsResponse {
    #[serde(default)]
    pub bars: Vec<ProviderBar>,
}
