//! Token bucket rate limiting.
//!
//! There is one limiter pair per scope: a global one shared by every peer
//! session in the engine, and one per torrent. A session wanting to move
//! N payload bytes acquires N tokens from both scopes; the effective rate
//! is therefore the minimum of the two. A zero configured rate means
//! unlimited and acquisition returns immediately.
//!
//! Shaping is advisory on the download side (the network may deliver bytes
//! regardless), so the engine paces REQUEST messages and delays block
//! acceptance with these buckets rather than trying to push back on TCP.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

/// The bucket refills continuously at the configured rate; bursts are
/// capped at a small multiple of a 100 ms refill, so a freshly idle bucket
/// doesn't dump many seconds worth of tokens at once.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    /// Refill rate in bytes per second. Zero means unlimited.
    rate: u64,
    /// The maximum token balance.
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(kib_per_sec: u64, now: Instant) -> Self {
        let rate = kib_per_sec * 1024;
        // two 100 ms refills worth of burst
        let capacity = rate as f64 / 5.0;
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Takes `bytes` tokens from the bucket if the balance allows,
    /// otherwise returns how long to wait before trying again.
    ///
    /// A request larger than the bucket capacity is granted whenever the
    /// bucket is full, letting the balance go negative; the debt delays
    /// later acquisitions, so the average rate still holds.
    pub fn try_acquire(
        &mut self,
        bytes: u64,
        now: Instant,
    ) -> Option<Duration> {
        if self.rate == 0 {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = self
            .capacity
            .min(self.tokens + elapsed.as_secs_f64() * self.rate as f64);

        let needed = (bytes as f64).min(self.capacity);
        if self.tokens >= needed {
            self.tokens -= bytes as f64;
            None
        } else {
            let deficit = needed - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate as f64))
        }
    }
}

/// A download/upload bucket pair for one scope.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    down: Mutex<TokenBucket>,
    up: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(down_kib: u64, up_kib: u64) -> Self {
        let now = Instant::now();
        Self {
            down: Mutex::new(TokenBucket::new(down_kib, now)),
            up: Mutex::new(TokenBucket::new(up_kib, now)),
        }
    }

    /// Waits until `bytes` download tokens are available and takes them.
    pub async fn acquire_down(&self, bytes: u32) {
        Self::acquire(&self.down, bytes).await
    }

    /// Waits until `bytes` upload tokens are available and takes them.
    pub async fn acquire_up(&self, bytes: u32) {
        Self::acquire(&self.up, bytes).await
    }

    async fn acquire(bucket: &Mutex<TokenBucket>, bytes: u32) {
        loop {
            let wait = bucket
                .lock()
                .expect("token bucket poisoned")
                .try_acquire(bytes as u64, Instant::now());
            match wait {
                None => return,
                Some(wait) => tokio::time::delay_for(wait).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rate_is_unlimited() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(0, now);
        for _ in 0..1000 {
            assert_eq!(bucket.try_acquire(1 << 20, now), None);
        }
    }

    #[test]
    fn test_burst_then_wait() {
        let now = Instant::now();
        // 100 KiB/s: burst capacity is 20 KiB
        let mut bucket = TokenBucket::new(100, now);

        // the initial burst is granted without waiting
        assert_eq!(bucket.try_acquire(20 * 1024, now), None);
        // the bucket is empty now: the next 16 KiB needs ~160 ms
        let wait = bucket.try_acquire(16 * 1024, now).unwrap();
        assert!(wait > Duration::from_millis(150));
        assert!(wait < Duration::from_millis(170));

        // after the wait has passed, the acquisition succeeds
        let later = now + wait;
        assert_eq!(bucket.try_acquire(16 * 1024, later), None);
    }

    #[test]
    fn test_average_rate_holds() {
        // 100 KiB/s, acquiring 16 KiB blocks back to back: moving 100 KiB
        // past the initial burst must require one simulated second
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100, start);
        // drain the initial burst
        assert_eq!(bucket.try_acquire(20 * 1024, start), None);

        let mut now = start;
        let mut moved = 0u64;
        while moved < 100 * 1024 {
            match bucket.try_acquire(16 * 1024, now) {
                None => moved += 16 * 1024,
                Some(wait) => now += wait,
            }
        }
        let elapsed = now.saturating_duration_since(start);
        assert!(elapsed >= Duration::from_millis(800), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1200), "{:?}", elapsed);
    }

    #[test]
    fn test_oversized_request_goes_into_debt() {
        let now = Instant::now();
        // 10 KiB/s: capacity is 2 KiB, far below one block
        let mut bucket = TokenBucket::new(10, now);

        // a full bucket grants the oversized request
        assert_eq!(bucket.try_acquire(16 * 1024, now), None);
        // the debt makes the next acquisition wait longer than a full
        // refill
        let wait = bucket.try_acquire(16 * 1024, now).unwrap();
        assert!(wait > Duration::from_secs(1));
    }
}
