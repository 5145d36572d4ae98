//! Settings management
//!
//! Global orchestrator settings, per job type policies and provider routes.

use crate::db::sqlite::models::{JobType, JobTypePolicy, OrchestratorSettings, ProviderRoute};
use crate::error::{AppError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;

/// Partial settings update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub max_concurrent_jobs: Option<i64>,
    pub tick_interval_secs: Option<u64>,
    pub lease_ttl_secs: Option<i64>,
    pub ensure_priority_boost: Option<i64>,
    pub backoff_jitter_pct: Option<f64>,
    pub scheduler_enabled: Option<bool>,
    pub api_enabled: Option<bool>,
}

/// Get settings
pub fn get_settings(conn: &Connection) -> Result<OrchestratorSettings> {
    let settings = conn.query_row(
        "SELECT max_concurrent_jobs, tick_interval_secs, lease_ttl_secs, ensure_priority_boost,
                backoff_jitter_pct, scheduler_enabled, api_enabled, api_host, api_port,
                calendar_exchange
         FROM settings WHERE id = 1",
        [],
        |row| {
            Ok(OrchestratorSettings {
                max_concurrent_jobs: row.get(0)?,
                tick_interval_secs: row.get::<_, i64>(1)?.max(1) as u64,
                lease_ttl_secs: row.get(2)?,
                ensure_priority_boost: row.get(3)?,
                backoff_jitter_pct: row.get(4)?,
                scheduler_enabled: row.get::<_, i32>(5)? == 1,
                api_enabled: row.get::<_, i32>(6)? == 1,
                api_host: row.get(7)?,
                api_port: row.get::<_, i64>(8)?.clamp(1, u16::MAX as i64) as u16,
                calendar_exchange: row.get(9)?,
            })
        },
    )?;

    Ok(settings)
}

/// Update settings
pub fn update_settings(conn: &Connection, update: &SettingsUpdate) -> Result<OrchestratorSettings> {
    let mut updates = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(n) = update.max_concurrent_jobs {
        if n < 1 {
            return Err(AppError::Validation("max_concurrent_jobs must be at least 1".to_string()));
        }
        updates.push("max_concurrent_jobs = ?");
        params.push(Box::new(n));
    }
    if let Some(secs) = update.tick_interval_secs {
        if secs == 0 {
            return Err(AppError::Validation("tick_interval_secs must be positive".to_string()));
        }
        updates.push("tick_interval_secs = ?");
        params.push(Box::new(secs as i64));
    }
    if let Some(ttl) = update.lease_ttl_secs {
        if ttl < 1 {
            return Err(AppError::Validation("lease_ttl_secs must be positive".to_string()));
        }
        updates.push("lease_ttl_secs = ?");
        params.push(Box::new(ttl));
    }
    if let Some(boost) = update.ensure_priority_boost {
        updates.push("ensure_priority_boost = ?");
        params.push(Box::new(boost));
    }
    if let Some(jitter) = update.backoff_jitter_pct {
        if !(0.0..=1.0).contains(&jitter) {
            return Err(AppError::Validation("backoff_jitter_pct must be within [0, 1]".to_string()));
        }
        updates.push("backoff_jitter_pct = ?");
        params.push(Box::new(jitter));
    }
    if let Some(enabled) = update.scheduler_enabled {
        updates.push("scheduler_enabled = ?");
        params.push(Box::new(enabled as i32));
    }
    if let Some(enabled) = update.api_enabled {
        updates.push("api_enabled = ?");
        params.push(Box::new(enabled as i32));
    }

    if !updates.is_empty() {
        updates.push("updated_at = datetime('now')");

        let sql = format!("UPDATE settings SET {} WHERE id = 1", updates.join(", "));

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        conn.execute(&sql, params_refs.as_slice())?;
    }

    get_settings(conn)
}

// ============================================================================
// Job Type Policies
// ============================================================================

fn map_policy(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobTypePolicy> {
    let job_type: String = row.get(0)?;
    Ok(JobTypePolicy {
        job_type: job_type
            .parse()
            .map_err(|e: AppError| super::job_definitions::conversion_error(0, e))?,
        max_slice_hours: row.get(1)?,
        max_slices_per_tick: row.get(2)?,
        max_attempts: row.get(3)?,
        backoff_base_secs: row.get(4)?,
        backoff_max_secs: row.get(5)?,
        run_timeout_secs: row.get(6)?,
    })
}

/// Policy for a job type, falling back to built-in defaults when no row exists
pub fn get_policy(conn: &Connection, job_type: JobType) -> Result<JobTypePolicy> {
    let policy = conn
        .query_row(
            "SELECT job_type, max_slice_hours, max_slices_per_tick, max_attempts,
                    backoff_base_secs, backoff_max_secs, run_timeout_secs
             FROM job_type_policies WHERE job_type = ?1",
            params![job_type.as_str()],
            map_policy,
        )
        .optional()?;

    Ok(policy.unwrap_or_else(|| JobTypePolicy::default_for(job_type)))
}

pub fn list_policies(conn: &Connection) -> Result<Vec<JobTypePolicy>> {
    JobType::ALL.iter().map(|jt| get_policy(conn, *jt)).collect()
}

pub fn upsert_policy(conn: &Connection, policy: &JobTypePolicy) -> Result<JobTypePolicy> {
    if policy.max_slice_hours < 1
        || policy.max_slices_per_tick < 0
        || policy.max_attempts < 1
        || policy.backoff_base_secs < 0
        || policy.backoff_max_secs < policy.backoff_base_secs
        || policy.run_timeout_secs < 1
    {
        return Err(AppError::Validation(format!(
            "Invalid policy for {}",
            policy.job_type
        )));
    }

    conn.execute(
        "INSERT INTO job_type_policies
            (job_type, max_slice_hours, max_slices_per_tick, max_attempts,
             backoff_base_secs, backoff_max_secs, run_timeout_secs)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (job_type) DO UPDATE SET
            max_slice_hours = excluded.max_slice_hours,
            max_slices_per_tick = excluded.max_slices_per_tick,
            max_attempts = excluded.max_attempts,
            backoff_base_secs = excluded.backoff_base_secs,
            backoff_max_secs = excluded.backoff_max_secs,
            run_timeout_secs = excluded.run_timeout_secs",
        params![
            policy.job_type.as_str(),
            policy.max_slice_hours,
            policy.max_slices_per_tick,
            policy.max_attempts,
            policy.backoff_base_secs,
            policy.backoff_max_secs,
            policy.run_timeout_secs,
        ],
    )?;

    get_policy(conn, policy.job_type)
}

// ============================================================================
// Provider Routes
// ============================================================================

pub fn list_provider_routes(conn: &Connection) -> Result<Vec<ProviderRoute>> {
    let mut stmt = conn.prepare(
        "SELECT job_type, provider_name, base_url, rate_per_second, max_bars_per_request, timeout_secs
         FROM provider_routes ORDER BY job_type",
    )?;

    let routes = stmt
        .query_map([], |row| {
            let job_type: String = row.get(0)?;
            Ok(ProviderRoute {
                job_type: job_type
                    .parse()
                    .map_err(|e: AppError| super::job_definitions::conversion_error(0, e))?,
                provider_name: row.get(1)?,
                base_url: row.get(2)?,
                rate_per_second: row.get::<_, i64>(3)?.max(1) as u32,
                max_bars_per_request: row.get(4)?,
                timeout_secs: row.get::<_, i64>(5)?.max(1) as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(routes)
}

pub fn upsert_provider_route(conn: &Connection, route: &ProviderRoute) -> Result<()> {
    if route.max_bars_per_request < 1 || route.rate_per_second == 0 {
        return Err(AppError::Validation(format!(
            "Invalid route for {}: rate and page size must be positive",
            route.job_type
        )));
    }

    conn.execute(
        "INSERT INTO provider_routes
            (job_type, provider_name, base_url, rate_per_second, max_bars_per_request, timeout_secs)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (job_type) DO UPDATE SET
            provider_name = excluded.provider_name,
            base_url = excluded.base_url,
            rate_per_second = excluded.rate_per_second,
            max_bars_per_request = excluded.max_bars_per_request,
            timeout_secs = excluded.timeout_secs",
        params![
            route.job_type.as_str(),
            route.provider_name,
            route.base_url,
            route.rate_per_second as i64,
            route.max_bars_per_request,
            route.timeout_secs as i64,
        ],
    )?;

    tracing::info!(
        "Provider route set: {} -> {} ({})",
        route.job_type,
        route.provider_name,
        route.base_url
    );
    Ok(())
}
