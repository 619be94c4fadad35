//! Sliding-window rate limiter
//!
//! Tracks send timestamps inside a rolling window and makes callers
//! wait until the oldest timestamp ages out instead of failing.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateWindow {
    limit: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl RateWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            stamps: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Wait until a slot is free inside the window, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut stamps = self.stamps.lock().await;
                let now = Instant::now();
                while stamps
                    .front()
                    .is_some_and(|&t| now.duration_since(t) >= self.window)
                {
                    stamps.pop_front();
                }
                if stamps.len() < self.limit {
                    stamps.push_back(now);
                    return;
                }
                // Oldest entry decides when the next slot opens. A
                // zero limit disables pacing entirely.
                let Some(&oldest) = stamps.front() else { return };
                self.window - now.duration_since(oldest)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waits_for_window_to_roll() {
        let limiter = RateWindow::new(2, Duration::from_secs(1));
        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn under_limit_does_not_wait() {
        let limiter = RateWindow::new(3, Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
