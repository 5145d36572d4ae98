//! Per-provider rate limiting
//!
//! One token bucket per provider name. Workers wait for a token before each
//! provider call so that concurrent runs against the same provider share
//! its request budget.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Token bucket rate limiter
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens (requests) allowed per period
    capacity: u32,
    /// Current available tokens
    tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last refill time
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a new token bucket
    pub fn new(rate_per_second: u32) -> Self {
        let rate = rate_per_second.max(1);
        Self {
            capacity: rate,
            tokens: rate as f64,
            refill_rate: rate as f64,
            last_refill: Instant::now(),
        }
    }

    /// Update the rate limit
    pub fn update_rate(&mut self, rate_per_second: u32) {
        let rate = rate_per_second.max(1);
        self.capacity = rate;
        self.refill_rate = rate as f64;
        // Don't exceed new capacity
        if self.tokens > self.capacity as f64 {
            self.tokens = self.capacity as f64;
        }
    }

    /// Try to consume a token, returns true if allowed
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let refill_amount = elapsed.as_secs_f64() * self.refill_rate;

        self.tokens = (self.tokens + refill_amount).min(self.capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Get time until a token will be available
    pub fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let tokens_needed = 1.0 - self.tokens;
            Duration::from_secs_f64(tokens_needed / self.refill_rate)
        }
    }
}

/// Shared limiter keyed by provider name
#[derive(Debug, Default)]
pub struct ProviderRateLimiter {
    buckets: DashMap<String, TokenBucket>,
}

impl ProviderRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a token for `provider` without waiting
    pub fn try_acquire(&self, provider: &str, rate_per_second: u32) -> Result<(), Duration> {
        let mut bucket = self
            .buckets
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(rate_per_second));

        if bucket.capacity != rate_per_second.max(1) {
            bucket.update_rate(rate_per_second);
        }

        if bucket.try_acquire() {
            Ok(())
        } else {
            Err(bucket.time_until_available())
        }
    }

    /// Wait until a token for `provider` is available, then take it
    pub async fn acquire(&self, provider: &str, rate_per_second: u32) {
        loop {
            // The map guard is released before sleeping
            let wait = match self.try_acquire(provider, rate_per_second) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tracing::debug!("Rate limit for {} reached, waiting {:?}", provider, wait);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_basic() {
        let mut bucket = TokenBucket::new(10); // 10 per second

        // Should allow first 10 requests
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }

        // 11th should fail
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_token_bucket_refill() {
        let mut bucket = TokenBucket::new(100);

        // Drain all tokens
        for _ in 0..100 {
            bucket.try_acquire();
        }
        assert!(!bucket.try_acquire());

        // Simulate time passing (force refill)
        bucket.last_refill = Instant::now() - Duration::from_millis(100);

        // Should have ~10 tokens now (100/s * 0.1s)
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
    }

    #[test]
    fn test_buckets_are_per_provider() {
        let limiter = ProviderRateLimiter::new();

        assert!(limiter.try_acquire("alpha", 1).is_ok());
        let wait = limiter.try_acquire("alpha", 1).unwrap_err();
        assert!(wait <= Duration::from_secs(1));

        // A different provider has its own budget
        assert!(limiter.try_acquire("beta", 1).is_ok());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = ProviderRateLimiter::new();
        limiter.acquire("alpha", 20).await;
        for _ in 0..19 {
            limiter.try_acquire("alpha", 20).unwrap();
        }

        let started = Instant::now();
        limiter.acquire("alpha", 20).await;
        // One token at 20/s takes ~50ms
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
