//! Generic JSON-over-HTTP bar provider
//!
//! `GET {base_url}/bars?symbol=..&timeframe=..&start=..&end=..` returning
//! `{"bars": [{"ts": "...", "open": .., "high": .., "low": .., "close": .., "volume": ..}]}`.

use super::types::BarsResponse;
use super::{BarProvider, BarRequest, ProviderBar, ProviderError};
use crate::db::sqlite::models::ProviderRoute;
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// HTTP bar provider configured from a routing entry
pub struct HttpBarProvider {
    name: String,
    base_url: String,
    client: Client,
    rate_per_second: u32,
    max_bars_per_request: i64,
    timeout: Duration,
}

impl HttpBarProvider {
    pub fn from_route(route: &ProviderRoute) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(route.timeout_secs.max(1));
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            name: route.provider_name.clone(),
            base_url: route.base_url.trim_end_matches('/').to_string(),
            client,
            rate_per_second: route.rate_per_second,
            max_bars_per_request: route.max_bars_per_request.max(1),
            timeout,
        })
    }
}

/// Map a non-success HTTP status to the provider error taxonomy
pub fn map_status(status: StatusCode, retry_after: Option<&str>, body: &str) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::AuthFailed(format!("HTTP {}", status.as_u16()))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProviderError::Timeout(Duration::ZERO)
        }
        _ => {
            let snippet: String = body.chars().take(200).collect();
            ProviderError::Upstream(format!("HTTP {}: {}", status.as_u16(), snippet))
        }
    }
}

#[async_trait]
impl BarProvider for HttpBarProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_bars_per_request(&self) -> i64 {
        self.max_bars_per_request
    }

    fn rate_per_second(&self) -> u32 {
        self.rate_per_second
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch_bars(&self, request: &BarRequest) -> Result<Vec<ProviderBar>, ProviderError> {
        let start = request.start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = request.end.to_rfc3339_opts(SecondsFormat::Secs, true);

        let response = self
            .client
            .get(format!("{}/bars", self.base_url))
            .query(&[
                ("symbol", request.symbol.as_str()),
                ("timeframe", request.timeframe.as_str()),
                ("start", start.as_str()),
                ("end", end.as_str()),
            ])
            .send()
            .await
            .map_err(|e| match ProviderError::from(e) {
                ProviderError::Timeout(_) => ProviderError::Timeout(self.timeout),
                other => other,
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("{} returned {} for {}", self.name, status, request.symbol);
            return Err(map_status(status, retry_after.as_deref(), &body));
        }

        let body: BarsResponse = response.json().await?;
        Ok(body.bars)
    }
}
