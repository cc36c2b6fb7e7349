use std::time::Duration;

use tokio::time::Instant;

/// Token-bucket byte-rate limiter with a one-second burst.
///
/// A rate of 0 disables limiting. A single request larger than the burst
/// is allowed through after waiting for its full deficit.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u64,
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: bytes_per_sec,
            tokens: bytes_per_sec as f64,
            last: Instant::now(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Waits until `bytes` may pass.
    pub async fn acquire(&mut self, bytes: usize) {
        if let Some(wait) = self.reserve(bytes) {
            tokio::time::sleep(wait).await;
        }
    }

    /// Takes `bytes` from the bucket, returning how long the caller must
    /// wait before using them.
    fn reserve(&mut self, bytes: usize) -> Option<Duration> {
        if self.rate == 0 {
            return None;
        }
        let now = Instant::now();
        let rate = self.rate as f64;
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * rate).min(rate);

        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(-self.tokens / rate))
    }
}
