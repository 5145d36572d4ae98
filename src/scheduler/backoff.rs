//! Jittered exponential backoff between run attempts

use crate::db::sqlite::models::JobTypePolicy;
use rand::Rng;
use std::time::Duration;

/// Delay before a failed run becomes eligible for retry.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub jitter_pct: f64,
}

impl BackoffPolicy {
    pub fn new(base_delay_secs: u64, max_delay_secs: u64, jitter_pct: f64) -> Self {
        let clamped_base = base_delay_secs.max(1);
        Self {
            base_delay_secs: clamped_base,
            max_delay_secs: max_delay_secs.max(clamped_base),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    pub fn for_job_type(policy: &JobTypePolicy, jitter_pct: f64) -> Self {
        Self::new(
            policy.backoff_base_secs.max(0) as u64,
            policy.backoff_max_secs.max(0) as u64,
            jitter_pct,
        )
    }

    /// Delay after the given (1-based) attempt failed: `base * 2^(attempt-1)`,
    /// capped, then spread by +/- `jitter_pct`.
    pub fn next_delay(&self, attempt: i64) -> Duration {
        let exp = 2_u64.saturating_pow(attempt.saturating_sub(1).clamp(0, 63) as u32);
        let mut delay_ms = self.base_delay_secs.saturating_mul(1000).saturating_mul(exp);
        let max_ms = self.max_delay_secs.saturating_mul(1000);
        if delay_ms > max_ms {
            delay_ms = max_ms;
        }
        let jittered = if self.jitter_pct > 0.0 {
            let mut rng = rand::thread_rng();
            let spread = (delay_ms as f64 * self.jitter_pct) as i64;
            let delta = rng.gen_range(-spread..=spread);
            delay_ms.saturating_add_signed(delta)
        } else {
            delay_ms
        };
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::models::JobType;

    #[test]
    fn test_new_clamps_input_parameters() {
        let policy = BackoffPolicy::new(0, 0, 2.0);
        assert_eq!(policy.base_delay_secs, 1);
        assert_eq!(policy.max_delay_secs, 1);
        assert_eq!(policy.jitter_pct, 1.0);
    }

    #[test]
    fn test_next_delay_doubles_and_caps() {
        let policy = BackoffPolicy::new(30, 100, 0.0);
        let delays: Vec<_> = (1..=5).map(|attempt| policy.next_delay(attempt)).collect();
        assert_eq!(delays[0], Duration::from_secs(30));
        assert_eq!(delays[1], Duration::from_secs(60));
        assert_eq!(delays[2], Duration::from_secs(100)); // capped
        assert_eq!(delays[4], Duration::from_secs(100));
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let policy = BackoffPolicy::for_job_type(&JobTypePolicy::default_for(JobType::FetchIntraday), 0.2);
        for _ in 0..50 {
            let delay = policy.next_delay(1);
            assert!(delay >= Duration::from_secs(24) && delay <= Duration::from_secs(36));
        }
    }
}
