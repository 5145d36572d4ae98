//! Background scheduling
//!
//! - `TickScheduler` - Periodic tick and retry passes
//! - `BackoffPolicy` - Retry delays between run attempts

pub mod backoff;
mod tick_scheduler;

pub use backoff::BackoffPolicy;
pub use tick_scheduler::TickScheduler;
