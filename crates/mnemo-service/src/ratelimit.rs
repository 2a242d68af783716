//! Per-user token-bucket rate limiting.

use std::time::Instant;

use dashmap::DashMap;

use mnemo_core::config::RateLimitConfig;
use mnemo_core::error::MnemoError;
use mnemo_core::types::UserId;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per user: `burst` capacity, continuous refill.
pub struct RateLimiter {
    buckets: DashMap<i64, Bucket>,
    burst: f64,
    refill_per_second: f64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            burst: config.burst_per_user as f64,
            refill_per_second: config.refill_per_second,
        }
    }

    /// Take one token, failing with the typed error when the bucket is dry.
    pub fn try_acquire(&self, user_id: UserId) -> Result<(), MnemoError> {
        let mut bucket = self.buckets.entry(user_id.as_i64()).or_insert_with(|| Bucket {
            tokens: self.burst,
            last_refill: Instant::now(),
        });

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.burst);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(MnemoError::RateLimitExceeded {
                user_id: user_id.as_i64(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32, refill: f64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            burst_per_user: burst,
            refill_per_second: refill,
        })
    }

    #[test]
    fn burst_then_rejection() {
        let l = limiter(3, 0.0);
        let user = UserId(1);
        assert!(l.try_acquire(user).is_ok());
        assert!(l.try_acquire(user).is_ok());
        assert!(l.try_acquire(user).is_ok());
        let err = l.try_acquire(user).unwrap_err();
        assert!(matches!(err, MnemoError::RateLimitExceeded { user_id: 1 }));
    }

    #[test]
    fn users_have_independent_buckets() {
        let l = limiter(1, 0.0);
        assert!(l.try_acquire(UserId(1)).is_ok());
        assert!(l.try_acquire(UserId(2)).is_ok());
        assert!(l.try_acquire(UserId(1)).is_err());
    }

    #[test]
    fn bucket_refills_over_time() {
        let l = limiter(1, 1000.0);
        let user = UserId(1);
        assert!(l.try_acquire(user).is_ok());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(l.try_acquire(user).is_ok());
    }
}
