//! Bar timeframes

use crate::db::sqlite::models::JobType;
use crate::error::{AppError, Result};
use chrono::{DateTime, Datelike, Duration, DurationRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of one regular US equities session (09:30 - 16:00)
const SESSION_MINUTES: i64 = 390;

/// Supported bar timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// Duration of a single bar
    pub fn bar_duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
            Timeframe::W1 => Duration::weeks(1),
        }
    }

    pub fn is_intraday(&self) -> bool {
        !matches!(self, Timeframe::D1 | Timeframe::W1)
    }

    /// Job type that keeps this timeframe fresh when none is given
    pub fn default_job_type(&self) -> JobType {
        if self.is_intraday() {
            JobType::FetchIntraday
        } else {
            JobType::FetchHistorical
        }
    }

    /// Trading time that must elapse past the covered range before it is stale.
    ///
    /// One bar for intraday timeframes, one full session for daily bars and
    /// five sessions for weekly bars.
    pub fn staleness_threshold(&self) -> Duration {
        match self {
            Timeframe::D1 => Duration::minutes(SESSION_MINUTES),
            Timeframe::W1 => Duration::minutes(SESSION_MINUTES * 5),
            _ => self.bar_duration(),
        }
    }

    /// Align a timestamp down to the start of its bar
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timeframe::W1 => {
                let day = ts.date_naive();
                let monday = day - Duration::days(day.weekday().num_days_from_monday() as i64);
                Utc.from_utc_datetime(&monday.and_hms_opt(0, 0, 0).unwrap_or_default())
            }
            _ => ts.duration_trunc(self.bar_duration()).unwrap_or(ts),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" | "d1" => Ok(Timeframe::D1),
            "1w" | "w1" => Ok(Timeframe::W1),
            other => Err(AppError::Validation(format!("Unsupported timeframe: {}", other))),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_every_timeframe() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert!("2h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_floor_hour_and_week() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 15, 14, 37, 12).unwrap();
        assert_eq!(
            Timeframe::H1.floor(ts),
            Utc.with_ymd_and_hms(2026, 10, 15, 14, 0, 0).unwrap()
        );
        assert_eq!(
            Timeframe::M15.floor(ts),
            Utc.with_ymd_and_hms(2026, 10, 15, 14, 30, 0).unwrap()
        );
        // 2026-10-15 is a Thursday
        assert_eq!(
            Timeframe::W1.floor(ts),
            Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_default_job_type() {
        assert_eq!(Timeframe::M5.default_job_type(), JobType::FetchIntraday);
        assert_eq!(Timeframe::D1.default_job_type(), JobType::FetchHistorical);
    }
}
