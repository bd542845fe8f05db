//! Cooperative publish rate limiting
//!
//! The publisher awaits an injected throttle before each send; a denied
//! acquire delays the caller rather than queueing the message.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::settings::Settings;

/// A cooperative rate limiter
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Suspend until the caller may proceed
    async fn acquire(&self);
}

/// Token-bucket throttle allowing `limit` acquisitions per interval
pub struct RateThrottle {
    limiter: DefaultDirectRateLimiter,
}

impl RateThrottle {
    /// Build a throttle allowing `limit` messages per `interval_ms`
    pub fn new(limit: u32, interval_ms: u64) -> Result<Self> {
        let limit = NonZeroU32::new(limit)
            .ok_or_else(|| Error::Config("rate limit must be at least 1".to_string()))?;
        let interval = Duration::from_millis(interval_ms.max(1));
        let period = (interval / limit.get()).max(Duration::from_nanos(1));
        let quota = Quota::with_period(period)
            .ok_or_else(|| Error::Config("rate interval must be positive".to_string()))?
            .allow_burst(limit);

        Ok(Self {
            limiter: RateLimiter::direct(quota),
        })
    }
}

#[async_trait]
impl Throttle for RateThrottle {
    async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

/// Per-class throttles built from the configured limits
#[derive(Clone, Default)]
pub struct Throttles {
    /// Data and HTTP-reply messages
    pub data: Option<Arc<dyn Throttle>>,
    /// Error messages
    pub error: Option<Arc<dyn Throttle>>,
    /// Snapshot messages
    pub snapshot: Option<Arc<dyn Throttle>>,
}

impl Throttles {
    /// Build throttles from the configured per-class limits; an absent
    /// limit leaves that class unthrottled.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let interval = settings.rate_interval;
        let build = |limit: Option<u32>| -> Result<Option<Arc<dyn Throttle>>> {
            limit
                .map(|l| RateThrottle::new(l, interval).map(|t| Arc::new(t) as Arc<dyn Throttle>))
                .transpose()
        };

        Ok(Self {
            data: build(settings.data_rate_limit)?,
            error: build(settings.error_rate_limit)?,
            snapshot: build(settings.snapshot_rate_limit)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_zero_limit_rejected() {
        assert!(RateThrottle::new(0, 1000).is_err());
    }

    #[tokio::test]
    async fn test_acquire_within_burst_is_immediate() {
        let throttle = RateThrottle::new(10, 1000).unwrap();

        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acquire_beyond_burst_delays() {
        let throttle = RateThrottle::new(2, 200).unwrap();
        throttle.acquire().await;
        throttle.acquire().await;

        let start = Instant::now();
        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_from_settings_respects_absent_limits() {
        let mut settings = crate::test_support::settings();
        settings.data_rate_limit = Some(5);

        let throttles = Throttles::from_settings(&settings).unwrap();
        assert!(throttles.data.is_some());
        assert!(throttles.error.is_none());
        assert!(throttles.snapshot.is_none());
    }
}
