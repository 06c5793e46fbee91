//! Per-connector request throttling.
//!
//! Each connector owns one [`RateLimiter`], a token bucket whose capacity is
//! the connector's `requests_per_window` and which refills continuously at
//! `capacity / window`. Limiters are never shared between connectors, so
//! distinct sources keep independent budgets.
//!
//! [`RateLimiter::acquire`] waits for a token, but never past the caller's
//! budget: when the next token cannot arrive in time it fails immediately
//! with [`ConnectorError::RateLimited`] instead of sleeping.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::ConnectorError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A full bucket of `requests_per_window` tokens refilled over `window`.
    ///
    /// Zero values are clamped to one request per one millisecond so the
    /// limiter can never divide by zero.
    pub fn new(requests_per_window: u32, window: Duration) -> Self {
        let capacity = requests_per_window.max(1) as f64;
        let window = window.max(Duration::from_millis(1));
        Self {
            capacity,
            refill_rate: capacity / window.as_secs_f64(),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, waiting at most `max_wait` for it. A `max_wait` too
    /// large to express as an instant waits without a deadline.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), ConnectorError> {
        let deadline = Instant::now().checked_add(max_wait);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.refill_rate)
                    .unwrap_or(Duration::MAX)
            };

            let too_late = match deadline {
                Some(deadline) => Instant::now()
                    .checked_add(wait)
                    .map_or(true, |ready| ready > deadline),
                None => false,
            };
            if too_late {
                return Err(ConnectorError::RateLimited(format!(
                    "next request token in {:?}, exceeds wait budget of {:?}",
                    wait, max_wait
                )));
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Whole tokens currently available.
    pub async fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens.floor() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
            bucket.last_refill = now;
        }
    }
}
