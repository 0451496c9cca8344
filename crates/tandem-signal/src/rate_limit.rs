//! Per-peer rate limiter for abuse-prone requests
//!
//! Guards pairing-code redemption and public room joins. Each granted
//! request occupies one slot that is released one window after it was
//! granted; a request is refused while all slots are occupied.
//!
//! Releases are applied lazily from stored deadlines on the next check,
//! which behaves the same as arming a timer per grant without spawning
//! anything. Refused requests take no slot. This is deliberately not a
//! sliding window over attempts: a client that spreads its grants across
//! a window boundary can get close to twice the ceiling in one window's
//! worth of wall time, and nothing smooths that out.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use tandem_core::SignalConfig;

/// Maximum granted requests per window
pub const DEFAULT_MAX_REQUESTS: u32 = 10;

/// Window after which a granted request frees its slot (in seconds)
pub const DEFAULT_WINDOW_SECS: u64 = 10;

/// Rate limiter configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
        }
    }
}

impl From<&SignalConfig> for RateLimitConfig {
    fn from(config: &SignalConfig) -> Self {
        Self {
            max_requests: config.rate_limit_max,
            window: config.rate_limit_window(),
        }
    }
}

/// Request budget of a single peer
#[derive(Clone, Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// When each occupied slot frees up, oldest first
    releases: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            releases: VecDeque::with_capacity(config.max_requests as usize),
        }
    }

    /// Take a slot if one is free at `now`
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.release_expired(now);
        if self.releases.len() >= self.config.max_requests as usize {
            return false;
        }
        self.releases.push_back(now + self.config.window);
        true
    }

    /// Slots currently occupied at `now`
    pub fn in_use(&mut self, now: Instant) -> usize {
        self.release_expired(now);
        self.releases.len()
    }

    fn release_expired(&mut self, now: Instant) {
        while self.releases.front().is_some_and(|release| *release <= now) {
            self.releases.pop_front();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_ceiling() {
        let mut limiter = RateLimiter::default();
        let now = Instant::now();

        for _ in 0..DEFAULT_MAX_REQUESTS {
            assert!(limiter.try_acquire(now));
        }
        assert!(!limiter.try_acquire(now));
        assert_eq!(limiter.in_use(now), DEFAULT_MAX_REQUESTS as usize);
    }

    #[test]
    fn test_slots_free_one_window_after_grant() {
        let mut limiter = RateLimiter::default();
        let start = Instant::now();
        let window = Duration::from_secs(DEFAULT_WINDOW_SECS);

        for _ in 0..DEFAULT_MAX_REQUESTS {
            assert!(limiter.try_acquire(start));
        }
        assert!(!limiter.try_acquire(start + window - Duration::from_millis(1)));
        assert!(limiter.try_acquire(start + window));
    }

    #[test]
    fn test_refused_requests_take_no_slot() {
        let config = RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(10),
        };
        let mut limiter = RateLimiter::new(config);
        let start = Instant::now();

        assert!(limiter.try_acquire(start));
        for s in 1..10 {
            assert!(!limiter.try_acquire(start + Duration::from_secs(s)));
        }
        // Hammering while refused does not push the release back
        assert!(limiter.try_acquire(start + Duration::from_secs(10)));
    }

    /// Documented boundary behavior: grants at the end of one window plus
    /// grants right after they free up exceed the ceiling within one
    /// window-length of wall time.
    #[test]
    fn test_boundary_burst_is_accepted() {
        let mut limiter = RateLimiter::default();
        let start = Instant::now();
        let late = start + Duration::from_millis(9_900);

        for _ in 0..DEFAULT_MAX_REQUESTS {
            assert!(limiter.try_acquire(late));
        }
        let after = late + Duration::from_secs(DEFAULT_WINDOW_SECS);
        let mut granted = DEFAULT_MAX_REQUESTS;
        for _ in 0..DEFAULT_MAX_REQUESTS {
            if limiter.try_acquire(after) {
                granted += 1;
            }
        }
        // 20 grants within 10.0s of wall time (9.9s .. 19.9s)
        assert_eq!(granted, 2 * DEFAULT_MAX_REQUESTS);
    }

    #[test]
    fn test_config_from_signal_config() {
        let signal = SignalConfig {
            rate_limit_max: 3,
            rate_limit_window_secs: 2,
            ..SignalConfig::default()
        };
        let config = RateLimitConfig::from(&signal);
        assert_eq!(config.max_requests, 3);
        assert_eq!(config.window, Duration::from_secs(2));
    }
}
