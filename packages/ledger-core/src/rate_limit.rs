//! Per-IP sliding-window rate limiting guarding sensitive operations
//! (prepare, confirm, transaction listing, merchant lookup, merchant
//! registration per spec §5). This is a guard, not a contract: the limiter
//! is approximate and per-process.

use std::net::IpAddr;
use std::num::NonZeroU32;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::error::CoreError;

pub struct SlidingWindowLimiter {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
}

impl SlidingWindowLimiter {
    /// `max_events` per `window`, approximated by governor's cell-rate
    /// algorithm rather than a literal ring buffer of timestamps.
    pub fn new(max_events: u32, window: std::time::Duration) -> Self {
        let quota = Quota::with_period(window / max_events.max(1))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(max_events.max(1)).unwrap()))
            .allow_burst(NonZeroU32::new(max_events.max(1)).unwrap());
        Self { limiter: RateLimiter::keyed(quota) }
    }

    pub fn check(&self, ip: IpAddr) -> crate::Result<()> {
        self.limiter.check_key(&ip).map_err(|_| CoreError::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    #[test]
    fn allows_events_within_quota_then_rejects() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(1));
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_err());
    }

    #[test]
    fn tracks_ips_independently() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1));
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.check(a).is_ok());
        assert!(limiter.check(b).is_ok());
        assert!(limiter.check(a).is_err());
    }
}
