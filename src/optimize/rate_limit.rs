//! Token-bucket pacing for outbound batch bytes.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with rate `R` bytes/sec and burst `B` bytes.
///
/// A rate of zero disables the limiter entirely: `acquire` returns
/// immediately. Requests larger than the burst are clamped to it, so a
/// single oversized batch drains the bucket instead of blocking forever.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Option<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_bytes_per_sec: u64, burst_bytes: u64) -> Self {
        let bucket = (rate_bytes_per_sec > 0).then(|| {
            Mutex::new(Bucket {
                tokens: burst_bytes as f64,
                last_refill: Instant::now(),
            })
        });

        Self {
            rate: rate_bytes_per_sec as f64,
            burst: burst_bytes as f64,
            bucket,
        }
    }

    /// Unlimited pacing.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn is_disabled(&self) -> bool {
        self.bucket.is_none()
    }

    /// Block until `n` tokens are available or the token is cancelled.
    ///
    /// Returns `false` when cancellation interrupted the wait.
    pub async fn acquire(&self, token: &CancellationToken, n: u64) -> bool {
        let Some(bucket) = &self.bucket else {
            return true;
        };
        let need = (n as f64).min(self.burst).max(0.0);

        loop {
            let wait = {
                let mut b = bucket.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(b.last_refill).as_secs_f64();
                b.tokens = (b.tokens + elapsed * self.rate).min(self.burst);
                b.last_refill = now;

                if b.tokens >= need {
                    b.tokens -= need;
                    return true;
                }
                Duration::from_secs_f64((need - b.tokens) / self.rate)
            };

            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
