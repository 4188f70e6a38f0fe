//! Shared outbound gate for the generation service.
//!
//! Every generation call from every page passes through one [`Throttle`]:
//!
//! 1. wait out the shared 429 cooldown, if one is active;
//! 2. wait for the optional requests-per-minute quota (`governor`);
//! 3. take one of `max_inflight_requests` semaphore permits.
//!
//! When any page is rate limited it calls [`Throttle::on_rate_limited`], which
//! pushes the cooldown forward for all pages at once. Pages therefore back off
//! together instead of each hammering the service on its own schedule.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::debug;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct Throttle {
    permits: Semaphore,
    quota: Option<DirectLimiter>,
    cooldown_until: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("available_permits", &self.permits.available_permits())
            .field("rpm_quota", &self.quota.is_some())
            .finish()
    }
}

impl Throttle {
    /// `max_inflight` is clamped to at least 1; `rpm = None` disables the quota.
    pub fn new(max_inflight: usize, requests_per_minute: Option<u32>) -> Self {
        let quota = requests_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm)));
        Self {
            permits: Semaphore::new(max_inflight.max(1)),
            quota,
            cooldown_until: Mutex::new(None),
        }
    }

    /// Wait until a call may be issued. Hold the permit for the call's duration.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        while let Some(remaining) = self.cooldown_remaining() {
            debug!("Throttle cooling down for {:?}", remaining);
            tokio::time::sleep(remaining).await;
        }
        if let Some(ref quota) = self.quota {
            quota.until_ready().await;
        }
        self.permits.acquire().await
    }

    /// Record a rate-limit response: no page issues a call for `delay`.
    ///
    /// An existing longer cooldown is never shortened.
    pub fn on_rate_limited(&self, delay: Duration) {
        let until = Instant::now() + delay;
        if let Ok(mut guard) = self.cooldown_until.lock() {
            match *guard {
                Some(existing) if existing >= until => {}
                _ => *guard = Some(until),
            }
        }
    }

    /// Time left on the shared cooldown, if any.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let guard = self.cooldown_until.lock().ok()?;
        let until = (*guard)?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_cap_inflight_calls() {
        let t = Throttle::new(2, None);
        let a = t.acquire().await.unwrap();
        let _b = t.acquire().await.unwrap();
        assert_eq!(t.available_permits(), 0);
        drop(a);
        assert_eq!(t.available_permits(), 1);
    }

    #[test]
    fn zero_inflight_is_clamped() {
        assert_eq!(Throttle::new(0, None).available_permits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_delays_acquire() {
        let t = Throttle::new(1, None);
        t.on_rate_limited(Duration::from_secs(5));
        assert!(t.cooldown_remaining().is_some());

        let start = Instant::now();
        let _p = t.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(t.cooldown_remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_cooldown_does_not_shrink_longer_one() {
        let t = Throttle::new(1, None);
        t.on_rate_limited(Duration::from_secs(10));
        t.on_rate_limited(Duration::from_secs(1));
        assert!(t.cooldown_remaining().unwrap() > Duration::from_secs(5));
    }
}
