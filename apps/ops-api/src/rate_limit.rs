//! Fixed-window rate limiting.
//!
//! Two uses:
//! - a per-connection message throttle, held on the connection itself;
//! - per-IP login throttles ([`LoginLimiter`]) counting attempts that did
//!   not end in a successful login.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::clock::Clock;
use crate::error::GatewayError;

/// At most `max` events per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub max: u32,
    pub window: Duration,
}

impl WindowLimit {
    pub fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }
}

/// Counter for the current window. Resets once `reset_at` passes.
#[derive(Debug, Clone, Copy)]
pub struct FixedWindow {
    count: u32,
    reset_at: DateTime<Utc>,
}

impl FixedWindow {
    pub fn new(now: DateTime<Utc>, limit: WindowLimit) -> Self {
        Self {
            count: 0,
            reset_at: now + limit.window,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    fn roll(&mut self, now: DateTime<Utc>, limit: WindowLimit) {
        if self.is_expired(now) {
            *self = Self::new(now, limit);
        }
    }

    /// Count one event. A rejected event is not counted.
    ///
    /// Returns the seconds until the window resets when the limit is reached.
    pub fn hit(&mut self, now: DateTime<Utc>, limit: WindowLimit) -> Result<(), u64> {
        self.roll(now, limit);
        if self.count >= limit.max {
            return Err(self.retry_after_secs(now));
        }
        self.count += 1;
        Ok(())
    }

    /// Rounded up, never zero.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// Per-IP limiter over login attempts.
///
/// Every attempt takes a slot before the password is checked; a successful
/// login clears the IP's record, so only failures stay counted. Entries are
/// evicted lazily on access and in bulk by [`LoginLimiter::sweep`].
pub struct LoginLimiter {
    limit: WindowLimit,
    clock: Arc<dyn Clock>,
    entries: DashMap<IpAddr, FixedWindow>,
}

impl LoginLimiter {
    pub fn new(limit: WindowLimit, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            clock,
            entries: DashMap::new(),
        }
    }

    /// Take one attempt slot for the IP, or reject once the window is used
    /// up. Counting and the limit check happen under the same entry lock.
    pub fn reserve(&self, ip: IpAddr) -> Result<(), GatewayError> {
        let now = self.clock.now();
        let hit = self
            .entries
            .entry(ip)
            .or_insert_with(|| FixedWindow::new(now, self.limit))
            .hit(now, self.limit);

        hit.map_err(|retry_after_secs| {
            tracing::warn!(%ip, retry_after_secs, "login attempts throttled");
            GatewayError::RateLimited {
                message: format!("Too many login attempts. Try again in {retry_after_secs} seconds."),
                retry_after_secs,
            }
        })
    }

    /// A successful login clears the IP's record.
    pub fn record_success(&self, ip: IpAddr) {
        self.entries.remove(&ip);
    }

    /// Drop every expired window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, w| !w.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1));

    #[test]
    fn n_plus_one_is_rejected_and_not_counted() {
        let limit = WindowLimit::new(3, Duration::seconds(60));
        let now = Utc::now();
        let mut window = FixedWindow::new(now, limit);

        for _ in 0..3 {
            assert!(window.hit(now, limit).is_ok());
        }
        assert_eq!(window.hit(now, limit), Err(60));
        assert_eq!(window.count(), 3);
    }

    #[test]
    fn new_window_resets_the_counter() {
        let limit = WindowLimit::new(2, Duration::seconds(10));
        let start = Utc::now();
        let mut window = FixedWindow::new(start, limit);
        window.hit(start, limit).unwrap();
        window.hit(start, limit).unwrap();
        assert!(window.hit(start + Duration::seconds(9), limit).is_err());

        let later = start + Duration::seconds(10);
        assert!(window.hit(later, limit).is_ok());
        assert_eq!(window.count(), 1);
    }

    #[test]
    fn retry_after_rounds_up() {
        let limit = WindowLimit::new(1, Duration::seconds(10));
        let start = Utc::now();
        let window = FixedWindow::new(start, limit);
        assert_eq!(window.retry_after_secs(start + Duration::milliseconds(8_500)), 2);
        assert_eq!(window.retry_after_secs(start + Duration::seconds(20)), 1);
    }

    #[test]
    fn login_limiter_blocks_after_max_failures() {
        let clock = Arc::new(ManualClock::default());
        let limiter = LoginLimiter::new(WindowLimit::new(5, Duration::minutes(5)), clock.clone());

        for _ in 0..5 {
            assert!(limiter.reserve(IP).is_ok());
        }
        let err = limiter.reserve(IP).unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        assert!(err.to_string().contains("300 seconds"));

        clock.advance(Duration::minutes(5));
        assert!(limiter.reserve(IP).is_ok());
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn concurrent_attempts_cannot_overrun_the_limit() {
        let clock = Arc::new(ManualClock::default());
        let limiter = LoginLimiter::new(WindowLimit::new(5, Duration::minutes(5)), clock);

        let admitted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..20)
                .map(|_| s.spawn(|| limiter.reserve(IP).is_ok()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });
        assert_eq!(admitted, 5);
    }

    #[test]
    fn success_clears_failures() {
        let clock = Arc::new(ManualClock::default());
        let limiter = LoginLimiter::new(WindowLimit::new(2, Duration::minutes(5)), clock);
        limiter.reserve(IP).unwrap();
        limiter.reserve(IP).unwrap();
        assert!(limiter.reserve(IP).is_err());

        limiter.record_success(IP);
        assert!(limiter.reserve(IP).is_ok());
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let clock = Arc::new(ManualClock::default());
        let limiter = LoginLimiter::new(WindowLimit::new(5, Duration::seconds(30)), clock.clone());
        limiter.reserve(IP).unwrap();
        limiter.reserve("10.0.0.2".parse().unwrap()).unwrap();
        assert_eq!(limiter.sweep(), 0);

        clock.advance(Duration::seconds(31));
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.tracked(), 0);
    }
}
