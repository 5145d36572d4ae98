//! Market primitives: bar timeframes and the exchange trading calendar

pub mod calendar;
pub mod timeframe;

pub use calendar::TradingCalendar;
pub use timeframe::Timeframe;
