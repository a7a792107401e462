use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{positive, wait_for, RateLimiter};
use crate::{Result, TransportError};

/// Token bucket: holds up to `capacity` tokens and refills at `fill_rate`
/// tokens per second, so bursts up to `capacity` pass at once.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    fill_rate: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    timestamp: Instant,
}

impl Bucket {
    fn refill(&mut self, capacity: f64, fill_rate: f64) -> f64 {
        let now = Instant::now();
        if self.tokens >= capacity {
            // A full bucket has nothing to accrue.
            self.timestamp = now;
            return self.tokens;
        }
        let delta = (fill_rate * now.duration_since(self.timestamp).as_secs_f64()).round();
        // The timestamp moves only once a whole token accrued, so frequent
        // reads do not throw away fractional progress.
        if delta > 0.0 {
            self.tokens = capacity.min(self.tokens + delta);
            self.timestamp = now;
        }
        self.tokens
    }
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: f64, fill_rate: f64) -> Result<Self> {
        if !(capacity.is_finite() && capacity >= 0.0) {
            return Err(TransportError::config(format!(
                "capacity must be a non negative number, got {capacity}"
            )));
        }
        let fill_rate = positive("fill_rate", fill_rate)?;
        Ok(Self {
            capacity,
            fill_rate,
            state: Mutex::new(Bucket {
                tokens: capacity,
                timestamp: Instant::now(),
            }),
        })
    }

    #[inline]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    #[inline]
    pub fn fill_rate(&self) -> f64 {
        self.fill_rate
    }

    #[cfg(test)]
    fn rewind(&self, by: Duration) {
        let mut state = self.state.lock();
        state.timestamp = state.timestamp.checked_sub(by).expect("clock too early");
    }
}

impl RateLimiter for TokenBucket {
    fn consume(&self, tokens: f64) -> Duration {
        let mut state = self.state.lock();
        let available = state.refill(self.capacity, self.fill_rate);
        let wait = ((tokens - available) / self.fill_rate).round();
        if wait <= 0.0 {
            state.tokens -= tokens;
            return Duration::ZERO;
        }
        wait_for(wait)
    }

    fn tokens(&self) -> f64 {
        self.state.lock().refill(self.capacity, self.fill_rate)
    }

    #[inline]
    fn burst(&self) -> f64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn token_bucket_arithmetic() {
        let tb = TokenBucket::new(100.0, 10.0).unwrap();
        assert_eq!(tb.tokens(), 100.0);

        assert_eq!(tb.consume(40.0), Duration::ZERO);
        assert_eq!(tb.tokens(), 60.0);
        assert_eq!(tb.consume(40.0), Duration::ZERO);
        assert_eq!(tb.tokens(), 20.0);

        // Not enough: report the wait, leave the bucket alone.
        assert_eq!(tb.consume(40.0), 2 * SEC);
        assert_eq!(tb.tokens(), 20.0);

        tb.rewind(SEC);
        assert_eq!(tb.tokens(), 30.0);
        assert_eq!(tb.consume(40.0), SEC);

        tb.rewind(SEC);
        assert_eq!(tb.tokens(), 40.0);
        assert_eq!(tb.consume(35.0), Duration::ZERO);
        assert_eq!(tb.tokens(), 5.0);
    }

    #[test]
    fn refill_is_capped() {
        let tb = TokenBucket::new(100.0, 10.0).unwrap();
        tb.consume(50.0);
        tb.rewind(10 * SEC);
        assert_eq!(tb.tokens(), 100.0);
    }

    #[test]
    fn frequent_reads_keep_fractional_refill() {
        let tb = TokenBucket::new(100.0, 10.0).unwrap();
        assert_eq!(tb.consume(100.0), Duration::ZERO);
        tb.rewind(Duration::from_millis(40));
        assert_eq!(tb.tokens(), 0.0);
        tb.rewind(Duration::from_millis(40));
        assert_eq!(tb.tokens(), 1.0);
    }

    #[test]
    fn idle_full_bucket_does_not_bank_time() {
        let tb = TokenBucket::new(100.0, 10.0).unwrap();
        tb.rewind(10 * SEC);
        assert_eq!(tb.consume(100.0), Duration::ZERO);
        assert_eq!(tb.tokens(), 0.0);
    }

    #[test]
    fn invalid_parameters() {
        assert!(matches!(
            TokenBucket::new(100.0, 0.0),
            Err(TransportError::Config(_))
        ));
        assert!(TokenBucket::new(100.0, -1.0).is_err());
        assert!(TokenBucket::new(100.0, f64::NAN).is_err());
        assert!(TokenBucket::new(-5.0, 1.0).is_err());
    }
}
