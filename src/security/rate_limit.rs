//! Per-server token-bucket limiter.
//!
//! Each server gets a bucket of `max(1, max_qps / live_proxies)` tokens
//! refilled at the same rate per second, so the gateway fleet as a whole
//! stays under the server's `max_qps`.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A simple token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, capacity: f64, refill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;
    }

    /// Take one token, or report how long until one is available.
    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> Result<(), Duration> {
        self.refill(capacity, refill_rate);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / refill_rate))
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    qps: u64,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Limiter for one proxy's share of `max_qps`.
    pub fn for_share(max_qps: u64, proxy_count: usize) -> Self {
        let share = (max_qps / proxy_count.max(1) as u64).max(1);
        Self::new(share)
    }

    pub fn new(qps: u64) -> Self {
        let qps = qps.max(1);
        Self {
            qps,
            bucket: Mutex::new(TokenBucket::new(qps as f64)),
        }
    }

    pub fn qps(&self) -> u64 {
        self.qps
    }

    /// Drop mode: false when no token is available right now.
    pub fn try_acquire(&self) -> bool {
        let rate = self.qps as f64;
        self.bucket.lock().try_acquire(rate, rate).is_ok()
    }

    /// Wait mode: resolves once a token is taken. Cancel by dropping the future.
    pub async fn acquire(&self) {
        let rate = self.qps as f64;
        loop {
            let wait = match self.bucket.lock().try_acquire(rate, rate) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
