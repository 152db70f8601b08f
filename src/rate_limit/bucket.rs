//! Token Bucket
//!
//! Lock-free consumption over an atomic token count; refills are guarded by
//! a small mutex around the last-refill instant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Token bucket for rate limiting
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum capacity (burst)
    capacity: u32,

    /// Current tokens
    tokens: Arc<AtomicU64>,

    /// Refill rate (tokens per second)
    refill_rate: f64,

    /// Last refill time
    last_refill: Arc<Mutex<Instant>>,

    /// Last successful or attempted consume, for idle reclamation
    last_used: Arc<Mutex<Instant>>,
}

impl TokenBucket {
    /// Create a new token bucket, starting full.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: Arc::new(AtomicU64::new(capacity as u64)),
            refill_rate,
            last_refill: Arc::new(Mutex::new(Instant::now())),
            last_used: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Create a bucket from burst capacity and a per-minute sustained rate.
    pub fn per_minute(burst: u32, per_minute: u32) -> Self {
        Self::new(burst, per_minute as f64 / 60.0)
    }

    /// Try to consume tokens
    pub fn try_consume(&self, tokens: u32) -> bool {
        self.refill();
        *self.last_used.lock().unwrap() = Instant::now();

        let tokens_u64 = tokens as u64;
        let mut current = self.tokens.load(Ordering::SeqCst);

        loop {
            if current < tokens_u64 {
                return false;
            }

            let new_value = current - tokens_u64;
            match self.tokens.compare_exchange_weak(
                current,
                new_value,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => {
                    current = actual;
                }
            }
        }
    }

    /// Return tokens to the bucket, saturating at capacity. Used when a
    /// later pipeline stage denies a request whose token was already taken.
    pub fn refund(&self, tokens: u32) {
        let tokens_u64 = tokens as u64;
        let mut current = self.tokens.load(Ordering::SeqCst);
        loop {
            let new_value = std::cmp::min(current + tokens_u64, self.capacity as u64);
            match self.tokens.compare_exchange_weak(
                current,
                new_value,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    current = actual;
                }
            }
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&self) {
        let mut last_refill = self.last_refill.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);

        if elapsed < Duration::from_millis(100) {
            // Don't refill too frequently
            return;
        }

        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate).floor() as u64;

        if tokens_to_add > 0 {
            let mut current = self.tokens.load(Ordering::SeqCst);
            loop {
                let new_value = std::cmp::min(current + tokens_to_add, self.capacity as u64);
                match self.tokens.compare_exchange_weak(
                    current,
                    new_value,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        *last_refill = now;
                        break;
                    }
                    Err(actual) => {
                        current = actual;
                    }
                }
            }
        }
    }

    /// Get current token count
    pub fn available(&self) -> u32 {
        self.tokens.load(Ordering::SeqCst) as u32
    }

    /// Get time until the given number of tokens will be available
    pub fn time_until_available(&self, tokens: u32) -> Duration {
        let current = self.available();
        if current >= tokens {
            return Duration::ZERO;
        }

        let needed = (tokens - current) as f64;
        let seconds = needed / self.refill_rate;
        Duration::from_secs_f64(seconds)
    }

    /// How long since this bucket was last touched.
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full() {
        let bucket = TokenBucket::new(100, 10.0);
        assert_eq!(bucket.available(), 100);
    }

    #[test]
    fn test_bucket_consume() {
        let bucket = TokenBucket::new(100, 10.0);
        assert!(bucket.try_consume(50));
        assert_eq!(bucket.available(), 50);
    }

    #[test]
    fn test_bucket_insufficient() {
        let bucket = TokenBucket::new(100, 10.0);
        assert!(bucket.try_consume(100));
        assert!(!bucket.try_consume(1));
    }

    #[test]
    fn test_per_minute_constructor() {
        let bucket = TokenBucket::per_minute(30, 60);
        assert_eq!(bucket.available(), 30);
        // 60 per minute = 1 per second
        bucket.try_consume(30);
        let wait = bucket.time_until_available(2);
        assert!(wait.as_secs_f64() >= 1.9 && wait.as_secs_f64() <= 2.1);
    }

    #[test]
    fn test_refund_saturates_at_capacity() {
        let bucket = TokenBucket::new(10, 1.0);
        bucket.try_consume(3);
        bucket.refund(2);
        assert_eq!(bucket.available(), 9);
        bucket.refund(100);
        assert_eq!(bucket.available(), 10);
    }

    #[test]
    fn test_time_until_available() {
        let bucket = TokenBucket::new(100, 10.0); // 10 tokens per second
        bucket.try_consume(100);

        let time = bucket.time_until_available(20);
        assert!(time.as_secs_f64() >= 1.9 && time.as_secs_f64() <= 2.1);
    }

    #[test]
    fn test_idle_tracking() {
        let bucket = TokenBucket::new(10, 1.0);
        bucket.try_consume(1);
        assert!(bucket.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn test_concurrent_consume_never_oversells() {
        use std::sync::Arc;
        let bucket = Arc::new(TokenBucket::new(100, 0.0001));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = bucket.clone();
            handles.push(std::thread::spawn(move || {
                let mut granted = 0u32;
                for _ in 0..50 {
                    if b.try_consume(1) {
                        granted += 1;
                    }
                }
                granted
            }));
        }
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total <= 100, "granted {} tokens from a 100-token bucket", total);
    }
}
