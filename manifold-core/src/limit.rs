//! Send-path rate limiting.
//!
//! A token bucket sits in front of every channel's encoder: a message of
//! `n` bytes consumes `n` tokens, tokens accrue at the configured rate,
//! and a denied acquisition returns the wait before enough tokens exist.
//! The processor never blocks on it — a denial arms a timer on the
//! event-loop thread and clears write interest until it fires.

use std::time::{Duration, Instant};

/// Outcome of a token acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Tokens consumed; send now.
    Granted,
    /// Not enough tokens; retry after the given wait.
    Wait(Duration),
}

/// Unit of a configured rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    BitsPerSecond,
    BytesPerSecond,
    BitsPerMinute,
    BytesPerMinute,
}

impl RateUnit {
    fn bytes_per_second(self, value: u64) -> f64 {
        match self {
            Self::BitsPerSecond => value as f64 / 8.0,
            Self::BytesPerSecond => value as f64,
            Self::BitsPerMinute => value as f64 / 8.0 / 60.0,
            Self::BytesPerMinute => value as f64 / 60.0,
        }
    }
}

/// Admission control on the send path.
pub trait RateLimiter: Send {
    /// Try to consume `n` tokens (one per byte on the wire).
    fn acquire(&mut self, n: usize) -> Grant;

    /// An independent limiter with the same configuration, for the next
    /// channel.
    fn clone_box(&self) -> Box<dyn RateLimiter>;
}

/// Limiter that never limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLimiter;

impl RateLimiter for NullLimiter {
    fn acquire(&mut self, _n: usize) -> Grant {
        Grant::Granted
    }

    fn clone_box(&self) -> Box<dyn RateLimiter> {
        Box::new(NullLimiter)
    }
}

/// Token bucket with lazy refill.
///
/// The burst capacity is one second of the configured rate. Messages
/// larger than the burst are still admitted: the bucket waits until it
/// is full and then goes into debt, which keeps the long-run rate
/// correct without deadlocking oversized messages.
#[derive(Debug, Clone)]
pub struct TokenBucketLimiter {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketLimiter {
    /// A bucket refilled at `value` per `unit`.
    ///
    /// # Panics
    ///
    /// Panics if the configured rate is zero.
    #[must_use]
    pub fn new(value: u64, unit: RateUnit) -> Self {
        let rate = unit.bytes_per_second(value);
        assert!(rate > 0.0, "rate must be positive");
        Self {
            rate,
            burst: rate,
            tokens: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn acquire(&mut self, n: usize) -> Grant {
        self.refill();
        let need = (n as f64).min(self.burst);
        if self.tokens >= need {
            self.tokens -= n as f64;
            return Grant::Granted;
        }
        let deficit = need - self.tokens;
        Grant::Wait(Duration::from_secs_f64(deficit / self.rate))
    }

    fn clone_box(&self) -> Box<dyn RateLimiter> {
        Box::new(Self::new_raw(self.rate))
    }
}

impl TokenBucketLimiter {
    fn new_raw(rate: f64) -> Self {
        Self {
            rate,
            burst: rate,
            tokens: rate,
            last_refill: Instant::now(),
        }
    }
}

/// The shared no-op limiter for unmetered channels.
#[must_use]
pub fn no_limit() -> NullLimiter {
    NullLimiter
}

/// A token bucket at `value` per `unit`.
#[must_use]
pub fn limit(value: u64, unit: RateUnit) -> TokenBucketLimiter {
    TokenBucketLimiter::new(value, unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn null_limiter_always_grants() {
        let mut limiter = no_limit();
        for _ in 0..1000 {
            assert_eq!(limiter.acquire(usize::MAX / 2), Grant::Granted);
        }
    }

    #[test]
    fn burst_then_denial() {
        let mut limiter = limit(1000, RateUnit::BytesPerSecond);
        // The initial burst covers one second of rate.
        assert_eq!(limiter.acquire(1000), Grant::Granted);
        match limiter.acquire(500) {
            Grant::Wait(wait) => {
                assert!(wait > Duration::from_millis(100));
                assert!(wait <= Duration::from_millis(600));
            }
            Grant::Granted => panic!("bucket should be empty"),
        }
    }

    #[test]
    fn lazy_refill_restores_tokens() {
        let mut limiter = limit(10_000, RateUnit::BytesPerSecond);
        assert_eq!(limiter.acquire(10_000), Grant::Granted);
        assert!(matches!(limiter.acquire(1000), Grant::Wait(_)));

        thread::sleep(Duration::from_millis(200));
        // ~2000 tokens accrued while sleeping.
        assert_eq!(limiter.acquire(1000), Grant::Granted);
    }

    #[test]
    fn bit_units_scale() {
        let mut limiter = limit(8000, RateUnit::BitsPerSecond); // 1000 B/s
        assert_eq!(limiter.acquire(1000), Grant::Granted);
        assert!(matches!(limiter.acquire(1000), Grant::Wait(_)));
    }

    #[test]
    fn oversized_message_is_not_starved() {
        let mut limiter = limit(1000, RateUnit::BytesPerSecond);
        // Twice the burst: admitted once the bucket is full, going into
        // debt rather than waiting forever.
        assert_eq!(limiter.acquire(2000), Grant::Granted);
        match limiter.acquire(1) {
            Grant::Wait(wait) => assert!(wait >= Duration::from_millis(900)),
            Grant::Granted => panic!("bucket should be deep in debt"),
        }
    }
}
