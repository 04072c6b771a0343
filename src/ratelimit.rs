//! Token-bucket rate limiter for outbound connector calls.
//!
//! Each connector instance carries one limiter shared by all tasks crawling
//! that source, so the per-source call rate stays bounded no matter how many
//! workers happen to be servicing it.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A thread-safe token bucket. `acquire` waits until a token is available.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// Allow `calls_per_second` sustained calls with a burst of the same size.
    pub fn per_second(calls_per_second: f64) -> Self {
        let capacity = calls_per_second.max(1.0);
        Self {
            capacity,
            refill_per_sec: calls_per_second.max(f64::MIN_POSITIVE),
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Take one token, sleeping until one becomes available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / self.refill_per_sec,
                    ))
                }
            };

            match wait {
                None => return,
                Some(delay) => sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_is_immediate() {
        let limiter = RateLimiter::per_second(5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_waits_when_exhausted() {
        let limiter = RateLimiter::per_second(10.0);
        for _ in 0..10 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        assert!(
            start.elapsed() >= Duration::from_millis(80),
            "11th call should have waited for a refill"
        );
    }

    #[tokio::test]
    async fn test_shared_across_clones() {
        let limiter = RateLimiter::per_second(4.0);
        let other = limiter.clone();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        other.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
