use std::time::Duration;

use tokio::time::Instant;

/// A token bucket that hands out reservations instead of blocking.
///
/// Every frame takes its size in tokens, even when the bucket does not hold that many. The
/// balance may go negative, in which case the caller must wait until the bucket refills to zero
/// before sending. Later frames queue up behind the debt of earlier ones.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    /// Refill rate in bytes per second.
    rate: f64,
    /// Maximum number of tokens the bucket can hold.
    burst: f64,
    /// Current balance in bytes.
    tokens: f64,
    /// Last time the balance was refilled.
    last: Instant,
}

impl TokenBucket {
    /// Creates a full bucket. Returns `None` if `rate` is zero, which means unlimited.
    pub(crate) fn new(rate: u64, burst: u32, now: Instant) -> Option<Self> {
        if rate == 0 {
            return None;
        }

        Some(Self { rate: rate as f64, burst: burst as f64, tokens: burst as f64, last: now })
    }

    /// Reserves `size` tokens at `now` and returns how long the caller has to wait for them.
    pub(crate) fn reserve(&mut self, size: u32, now: Instant) -> Duration {
        if now > self.last {
            let elapsed = (now - self.last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
            self.last = now;
        }

        self.tokens -= size as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}
