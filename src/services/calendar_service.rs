//! Calendar Service
//!
//! Operator maintenance of the market session and holiday tables that the
//! trading calendar is built from. Every write is checked by building a
//! calendar from the result, so a bad row never reaches gap detection.

use crate::db::sqlite::market::{CreateHolidayRequest, MarketHoliday, MarketTiming};
use crate::error::{AppError, Result};
use crate::market::TradingCalendar;
use crate::state::AppState;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Session timing and holidays for one exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarView {
    pub exchange: String,
    pub timing: Option<MarketTiming>,
    pub holidays: Vec<MarketHoliday>,
}

/// Session timing update
#[derive(Debug, Clone, Deserialize)]
pub struct SetTimingRequest {
    pub timezone: String,
    pub market_open: String,
    pub market_close: String,
}

fn normalize_exchange(exchange: &str) -> Result<String> {
    let exchange = exchange.trim().to_uppercase();
    if exchange.is_empty() {
        return Err(AppError::Validation("Exchange is required".to_string()));
    }
    Ok(exchange)
}

/// Calendar service for business logic
pub struct CalendarService;

impl CalendarService {
    pub fn get(state: &AppState, exchange: &str) -> Result<CalendarView> {
        let exchange = normalize_exchange(exchange)?;
        Ok(CalendarView {
            timing: state.sqlite.get_market_timing(&exchange)?,
            holidays: state.sqlite.get_market_holidays(&exchange)?,
            exchange,
        })
    }

    /// Create or replace an exchange's session
    pub fn set_timing(state: &AppState, exchange: &str, request: &SetTimingRequest) -> Result<MarketTiming> {
        let exchange = normalize_exchange(exchange)?;
        let candidate = MarketTiming {
            id: 0,
            exchange: exchange.clone(),
            timezone: request.timezone.trim().to_string(),
            market_open: request.market_open.trim().to_string(),
            market_close: request.market_close.trim().to_string(),
        };
        TradingCalendar::from_records(&candidate, &[]).map_err(|e| AppError::Validation(e.to_string()))?;

        let timing = state.sqlite.upsert_market_timing(
            &exchange,
            &candidate.timezone,
            &candidate.market_open,
            &candidate.market_close,
        )?;
        info!(
            "CalendarService::set_timing - {} {} {}-{}",
            timing.exchange, timing.timezone, timing.market_open, timing.market_close
        );
        Ok(timing)
    }

    /// Add a full-day closure; re-adding a date updates its description
    pub fn add_holiday(state: &AppState, request: &CreateHolidayRequest) -> Result<MarketHoliday> {
        let exchange = normalize_exchange(&request.exchange)?;
        let date = NaiveDate::parse_from_str(request.date.trim(), "%Y-%m-%d")
            .map_err(|e| AppError::Validation(format!("Invalid holiday date {}: {}", request.date, e)))?;

        state.sqlite.create_market_holiday(&CreateHolidayRequest {
            exchange,
            date: date.format("%Y-%m-%d").to_string(),
            description: request.description.clone(),
        })
    }

    pub fn delete_holiday(state: &AppState, id: i64) -> Result<()> {
        if !state.sqlite.delete_market_holiday(id)? {
            return Err(AppError::NotFound(format!("Market holiday {} not found", id)));
        }
        info!("CalendarService::delete_holiday - removed {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderRegistry;
    use crate::state::Clock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn state() -> AppState {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 15, 20, 0).unwrap();
        AppState::in_memory(Arc::new(Clock::manual(now)), ProviderRegistry::new()).unwrap()
    }

    fn holiday(exchange: &str, date: &str) -> CreateHolidayRequest {
        CreateHolidayRequest {
            exchange: exchange.to_string(),
            date: date.to_string(),
            description: Some("Closure".to_string()),
        }
    }

    #[test]
    fn test_holiday_closes_the_calendar() {
        let state = state();
        let friday = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        assert!(state.calendar().unwrap().is_trading_day(friday));

        let added = CalendarService::add_holiday(&state, &holiday("us", "2026-10-16")).unwrap();
        assert_eq!(added.exchange, "US");
        assert!(!state.calendar().unwrap().is_trading_day(friday));

        CalendarService::delete_holiday(&state, added.id).unwrap();
        assert!(state.calendar().unwrap().is_trading_day(friday));

        let err = CalendarService::delete_holiday(&state, added.id).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn test_set_timing_replaces_session() {
        let state = state();
        let request = SetTimingRequest {
            timezone: "America/New_York".to_string(),
            market_open: "04:00".to_string(),
            market_close: "20:00".to_string(),
        };
        CalendarService::set_timing(&state, "US", &request).unwrap();

        let view = CalendarService::get(&state, "us").unwrap();
        assert_eq!(view.timing.unwrap().market_open, "04:00");
        assert!(!view.holidays.is_empty());

        // 09:00 New York is pre-market under the default session
        let ts = Utc.with_ymd_and_hms(2026, 10, 16, 13, 0, 0).unwrap();
        assert!(state.calendar().unwrap().is_open(ts));
    }

    #[test]
    fn test_rejects_bad_calendar_input() {
        let state = state();
        let bad_tz = SetTimingRequest {
            timezone: "Mars/Olympus".to_string(),
            market_open: "09:30".to_string(),
            market_close: "16:00".to_string(),
        };
        let inverted = SetTimingRequest {
            timezone: "America/New_York".to_string(),
            market_open: "16:00".to_string(),
            market_close: "09:30".to_string(),
        };
        for request in [bad_tz, inverted] {
            let err = CalendarService::set_timing(&state, "US", &request).unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR");
        }
        assert_eq!(state.calendar().unwrap().exchange(), "US");
        assert_eq!(CalendarService::get(&state, "US").unwrap().timing.unwrap().market_open, "09:30");

        let err = CalendarService::add_holiday(&state, &holiday("US", "16/10/2026")).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(CalendarService::get(&state, " ").is_err());
    }
}
