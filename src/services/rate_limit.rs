//! Request pacing for the pull surface of the chain facade.
//!
//! A single slot refills every `1000 / rps` milliseconds; callers block in
//! FIFO order on the internal mutex until their slot arrives. This keeps
//! every RPC consumer in the process behind one shared budget.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    min_gap: Duration,
    next_free: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(rps: u32) -> Self {
        let rps = rps.max(1);
        Self {
            min_gap: Duration::from_micros(1_000_000 / rps as u64),
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Wait until a request slot is available.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_free.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.min_gap;
            slot
        };
        sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_consecutive_acquires() {
        let limiter = RateLimiter::new(100); // one slot per 10ms
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_limiter_grants_immediately() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rps_is_clamped_to_one() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
