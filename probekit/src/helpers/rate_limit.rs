use std::{sync::Mutex, time::Instant};

/// A simple token bucket rate limiter, shared by all the threads firing a
/// given probe.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    /// Maximum number of tokens the bucket holds.
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    inner: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub(crate) fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            inner: Mutex::new(BucketState {
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    /// Bucket allowing `rate` acquisitions per second, with no burst.
    pub(crate) fn per_second(rate: f64) -> Self {
        Self::new(rate.max(1.0), rate)
    }

    pub(crate) fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.inner.lock().unwrap();
        let elapsed = now.saturating_duration_since(state.last_update).as_secs_f64();

        // Refill tokens.
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_update = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
