//! Sliding-window admission control for outbound generation calls.
//!
//! Provider quotas are expressed as "N requests per minute", so the limiter
//! keeps the exact timestamps of the last `max_requests` admissions and
//! admits a new call only once the oldest of them has left the window.
//!
//! ## Locking
//!
//! The timestamp queue sits behind a `std::sync::Mutex` that is held only
//! for the eviction/record bookkeeping. The wait itself is an async
//! `tokio::time::sleep` taken after the guard is dropped, so other workers
//! keep evicting and recording while one caller waits. After waking, the
//! caller re-locks, re-evicts and re-checks; under contention it may wait
//! more than once, but every caller eventually proceeds.
//!
//! The limiter is an ordinary value: build one per run and hand an
//! `Arc<RateLimiter>` to every worker that needs it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Sliding-window rate limiter shared by all page workers.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter admitting at most `max_requests` calls per `window`.
    ///
    /// `max_requests` is clamped to at least 1.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            max_requests,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait until a slot is free inside the trailing window, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.try_admit(Instant::now()) {
                None => return,
                Some(wait) => wait,
            };
            debug!(
                "Rate limit reached ({} per {:?}); waiting {:.2}s",
                self.max_requests,
                self.window,
                wait.as_secs_f64()
            );
            sleep(wait).await;
        }
    }

    /// Calls currently recorded inside the window ending at `now`.
    pub fn in_flight(&self) -> usize {
        let mut admitted = self.lock();
        self.evict(&mut admitted, Instant::now());
        admitted.len()
    }

    /// Record an admission at `now` if the window has room; otherwise return
    /// how long until the oldest admission expires.
    fn try_admit(&self, now: Instant) -> Option<Duration> {
        let mut admitted = self.lock();
        self.evict(&mut admitted, now);

        if admitted.len() < self.max_requests {
            admitted.push_back(now);
            return None;
        }

        // Queue is non-empty here because max_requests ≥ 1.
        let oldest = *admitted.front()?;
        let wait = (oldest + self.window).saturating_duration_since(now);
        // A zero wait would spin; the next loop iteration evicts `oldest`.
        Some(wait.max(Duration::from_millis(1)))
    }

    fn evict(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = admitted.front() {
            if now.saturating_duration_since(front) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        // The guarded section never panics mid-update, so a poisoned queue is
        // still consistent.
        self.admitted.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_without_waiting() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_flight(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_call_waits_for_oldest_to_expire() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_rather_than_resets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire().await; // t=0
        tokio::time::sleep(Duration::from_secs(6)).await;
        limiter.acquire().await; // t=6
        limiter.acquire().await; // must wait for t=0 to expire → t=10
        let third = start.elapsed();
        assert!(third >= Duration::from_secs(10), "third admitted at {third:?}");
        assert!(third < Duration::from_secs(11), "third admitted at {third:?}");
        limiter.acquire().await; // waits for t=6 to expire → t=16
        assert!(start.elapsed() >= Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_respect_the_bound() {
        const R: usize = 3;
        const WINDOW: u64 = 10;
        const COUNT: usize = 2 * R + 1;

        let limiter = Arc::new(RateLimiter::new(R, Duration::from_secs(WINDOW)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..COUNT {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                start.elapsed()
            }));
        }

        let mut admitted = Vec::new();
        for h in handles {
            admitted.push(h.await.unwrap());
        }
        admitted.sort();

        // ceil(count/R - 1) * W
        let min_windows = ((COUNT as f64 / R as f64) - 1.0).ceil() as u64;
        let total = *admitted.last().unwrap();
        assert!(
            total >= Duration::from_secs(min_windows * WINDOW),
            "finished after {total:?}"
        );

        // No window of WINDOW seconds holds more than R admissions.
        for (i, &t) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&u| u < t + Duration::from_secs(WINDOW))
                .count();
            assert!(in_window <= R, "{in_window} admissions in window at {t:?}");
        }
    }

    #[test]
    fn zero_requests_is_clamped() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.max_requests(), 1);
    }
}
