//! Lazy-refill token bucket used for the per-connection request and
//! file-storage rate limits. There is no queue: a denied caller is rejected
//! immediately and is expected to retry (or simply drop the request) on its
//! own schedule.

use crate::clock::SharedClock;
use parking_lot::Mutex;

#[derive(Debug)]
struct State {
    tokens: u64,
    last_filled: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: u64,
    clock: SharedClock,
    state: Mutex<State>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: u32, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            capacity: capacity as u64,
            refill_rate: refill_rate as u64,
            clock,
            state: Mutex::new(State {
                tokens: capacity as u64,
                last_filled: now,
            }),
        }
    }

    /// Refills lazily based on whole seconds elapsed since the last refill,
    /// then attempts to take one token. Returns `false` without blocking if
    /// the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let elapsed_secs = (now - state.last_filled).num_seconds().max(0) as u64;
        if elapsed_secs > 0 {
            let refill = elapsed_secs.saturating_mul(self.refill_rate);
            state.tokens = (state.tokens + refill).min(self.capacity);
            state.last_filled = now;
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::Arc;

    fn bucket(capacity: u32, refill_rate: u32) -> (TokenBucket, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(chrono::Utc::now()));
        let bucket = TokenBucket::new(capacity, refill_rate, clock.clone());
        (bucket, clock)
    }

    #[test]
    fn drains_capacity_then_denies() {
        let (bucket, _clock) = bucket(3, 1);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn refills_after_elapsed_seconds_capped_at_capacity() {
        let (bucket, clock) = bucket(2, 2);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        clock.advance(chrono::Duration::seconds(1));
        // refill_rate(2) * 1s = 2 tokens, capped at capacity(2)
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn sub_second_elapsed_time_does_not_refill() {
        let (bucket, clock) = bucket(1, 5);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        clock.advance(chrono::Duration::milliseconds(500));
        assert!(!bucket.try_acquire());
    }
}
