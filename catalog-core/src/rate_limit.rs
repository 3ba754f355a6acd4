use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

const MIN_WAIT: Duration = Duration::from_millis(10);

/// Token bucket shared by every caller that talks to the upstream API.
///
/// Tokens are refilled lazily on each acquisition, so no background task is
/// needed. The lock only covers the read-modify-write of the bucket; waiting
/// happens after it is released.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Capacity and refill rate both equal to `rpm`.
    pub fn per_minute(rpm: u32) -> Self {
        Self::with_capacity(rpm, rpm)
    }

    pub fn with_capacity(capacity: u32, refill_per_min: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: f64::from(refill_per_min.max(1)) / 60.0,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until `n` tokens are available and deducts them.
    ///
    /// Requests larger than the capacity are clamped to it, otherwise they
    /// could never be satisfied.
    pub async fn acquire(&self, n: u32) {
        let wanted = f64::from(n.max(1)).min(self.capacity);
        loop {
            match self.try_take(wanted) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait.max(MIN_WAIT)).await,
            }
        }
    }

    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn try_take(&self, wanted: f64) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            return Ok(());
        }
        let missing = wanted - bucket.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_sec))
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn acquisitions_within_capacity_do_not_wait() {
        let limiter = RateLimiter::with_capacity(2, 2);
        let start = Instant::now();
        limiter.acquire(1).await;
        limiter.acquire(1).await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn third_acquisition_waits_for_refill() {
        // 2 tokens per minute: one token every 30 seconds.
        let limiter = RateLimiter::with_capacity(2, 2);
        let start = Instant::now();
        limiter.acquire(1).await;
        limiter.acquire(1).await;
        limiter.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_capacity() {
        let limiter = RateLimiter::with_capacity(2, 120);
        limiter.acquire(2).await;
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!((limiter.available() - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_is_clamped_to_capacity() {
        let limiter = RateLimiter::with_capacity(2, 120);
        limiter.acquire(10).await;
        assert!(limiter.available() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_bucket() {
        let limiter = Arc::new(RateLimiter::with_capacity(2, 60));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire(1).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // Two tokens up front, the remaining two refill at one per second.
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
