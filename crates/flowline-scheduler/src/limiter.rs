use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};

/// Aggregate cap on create-execution calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests_per_second: u32,
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst: 10,
        }
    }
}

/// One limiter is built per executor and shared by catch-up and live fires.
pub fn build_limiter(limit: &RateLimit) -> DefaultDirectRateLimiter {
    let rate = NonZeroU32::new(limit.requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(limit.burst).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))
}

/// Wait for a token, giving up as soon as `cancel` fires.
pub async fn acquire(limiter: &DefaultDirectRateLimiter, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
        _ = limiter.until_ready() => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_available_immediately() {
        let limiter = build_limiter(&RateLimit {
            requests_per_second: 1,
            burst: 3,
        });
        for _ in 0..3 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }

    #[tokio::test]
    async fn zero_settings_fall_back_to_one() {
        let limiter = build_limiter(&RateLimit {
            requests_per_second: 0,
            burst: 0,
        });
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[tokio::test]
    async fn cancelled_wait_returns_promptly() {
        let limiter = build_limiter(&RateLimit {
            requests_per_second: 1,
            burst: 1,
        });
        assert!(limiter.check().is_ok());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            acquire(&limiter, &cancel).await,
            Err(SchedulerError::Cancelled)
        ));
    }
}
