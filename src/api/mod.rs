//! HTTP API
//!
//! Operator endpoints (tick, retry, dispatch, status, listings, job
//! definitions), the ensure-coverage gateway for latency-sensitive callers,
//! and the job run feed as Server-Sent Events.

pub mod handlers;
mod server;
mod types;

pub use server::{router, ApiServer};
pub use types::{ApiResponse, BarsQuery, Empty, PairQuery, RunsQuery, SetEnabledRequest, StatusQuery};
