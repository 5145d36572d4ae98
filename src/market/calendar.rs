//! Trading calendar
//!
//! Answers "was the market trading between these two instants" so that gap
//! detection never reports a closed market as missing data.

use crate::db::sqlite::market::{MarketHoliday, MarketTiming};
use crate::error::{AppError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::BTreeSet;

/// Regular session calendar for one exchange
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    exchange: String,
    tz: Tz,
    market_open: NaiveTime,
    market_close: NaiveTime,
    holidays: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(exchange: &str, tz: Tz, market_open: NaiveTime, market_close: NaiveTime) -> Self {
        Self {
            exchange: exchange.to_string(),
            tz,
            market_open,
            market_close,
            holidays: BTreeSet::new(),
        }
    }

    /// US equities regular session, 09:30 - 16:00 America/New_York
    pub fn us_equities() -> Self {
        Self::new(
            "US",
            chrono_tz::America::New_York,
            NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
        )
    }

    /// Build from the persisted timing row and holiday list
    pub fn from_records(timing: &MarketTiming, holidays: &[MarketHoliday]) -> Result<Self> {
        let tz: Tz = timing
            .timezone
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid timezone {}: {}", timing.timezone, e)))?;
        let market_open = parse_session_time(&timing.market_open)?;
        let market_close = parse_session_time(&timing.market_close)?;
        if market_close <= market_open {
            return Err(AppError::Config(format!(
                "Market close {} is not after open {} for {}",
                timing.market_close, timing.market_open, timing.exchange
            )));
        }

        let mut calendar = Self::new(&timing.exchange, tz, market_open, market_close);
        for holiday in holidays {
            let date = NaiveDate::parse_from_str(&holiday.date, "%Y-%m-%d")
                .map_err(|e| AppError::Config(format!("Invalid holiday {}: {}", holiday.date, e)))?;
            calendar.holidays.insert(date);
        }
        Ok(calendar)
    }

    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.insert(date);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// Session open/close in UTC for a local exchange date
    pub fn session_bounds(&self, date: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.is_trading_day(date) {
            return None;
        }
        let open = self.tz.from_local_datetime(&date.and_time(self.market_open)).earliest()?;
        let close = self.tz.from_local_datetime(&date.and_time(self.market_close)).earliest()?;
        Some((open.with_timezone(&Utc), close.with_timezone(&Utc)))
    }

    pub fn is_open(&self, ts: DateTime<Utc>) -> bool {
        let local_date = ts.with_timezone(&self.tz).date_naive();
        match self.session_bounds(local_date) {
            Some((open, close)) => ts >= open && ts < close,
            None => false,
        }
    }

    /// Total in-session time inside [from, to)
    pub fn trading_duration_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
        if to <= from {
            return Duration::zero();
        }
        let first = from.with_timezone(&self.tz).date_naive();
        let last = to.with_timezone(&self.tz).date_naive();

        let mut total = Duration::zero();
        let mut date = first;
        while date <= last {
            if let Some((open, close)) = self.session_bounds(date) {
                let start = open.max(from);
                let end = close.min(to);
                if end > start {
                    total = total + (end - start);
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        total
    }

    pub fn has_trading_time(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.trading_duration_between(from, to) > Duration::zero()
    }
}

impl Default for TradingCalendar {
    fn default() -> Self {
        Self::us_equities()
    }
}

fn parse_session_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| AppError::Config(format!("Invalid session time {}: {}", value, e)))
}
