use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{positive, wait_for, RateLimiter};
use crate::Result;

pub const DEFAULT_BURST_RATE: f64 = 2.0;

/// Leaky bucket: accumulates consumed units, which drain at `max_rate`
/// units per `interval`. Usage is admitted while the level stays within
/// `burst_rate * max_rate * interval`.
#[derive(Debug)]
pub struct LeakyBucket {
    interval: f64,
    max_rate: f64,
    max_tokens: f64,
    state: Mutex<Level>,
}

#[derive(Debug)]
struct Level {
    tokens: f64,
    timestamp: Instant,
}

impl Level {
    fn drain(&mut self, max_rate: f64, interval: f64) -> f64 {
        let now = Instant::now();
        if self.tokens <= 0.0 {
            self.tokens = 0.0;
            self.timestamp = now;
            return 0.0;
        }
        let elapsed = now.duration_since(self.timestamp).as_secs_f64();
        let delta = (max_rate * elapsed / interval).round();
        // As with refilling, the timestamp only moves once a whole unit
        // drained.
        if delta > 0.0 {
            self.tokens = (self.tokens - delta).max(0.0);
            self.timestamp = now;
        }
        self.tokens
    }
}

impl LeakyBucket {
    /// `interval` in seconds, `max_rate` in units per second.
    pub fn new(interval: f64, max_rate: f64) -> Result<Self> {
        Self::with_burst_rate(interval, max_rate, DEFAULT_BURST_RATE)
    }

    pub fn with_burst_rate(interval: f64, max_rate: f64, burst_rate: f64) -> Result<Self> {
        let interval = positive("interval", interval)?;
        let max_rate = positive("max_rate", max_rate)?;
        let burst_rate = positive("burst_rate", burst_rate)?;
        Ok(Self {
            interval,
            max_rate,
            max_tokens: burst_rate * max_rate * interval,
            state: Mutex::new(Level {
                tokens: 0.0,
                timestamp: Instant::now(),
            }),
        })
    }

    #[inline]
    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    /// Drain `tokens` units right away, independent of elapsed time.
    pub fn update(&self, tokens: f64) -> f64 {
        let mut state = self.state.lock();
        let level = state.drain(self.max_rate, self.interval);
        state.tokens = (level - tokens).max(0.0);
        state.tokens
    }

    #[cfg(test)]
    fn rewind(&self, by: Duration) {
        let mut state = self.state.lock();
        state.timestamp = state.timestamp.checked_sub(by).expect("clock too early");
    }
}

impl RateLimiter for LeakyBucket {
    fn consume(&self, tokens: f64) -> Duration {
        let mut state = self.state.lock();
        let level = state.drain(self.max_rate, self.interval);
        let wait = ((level + tokens - self.max_tokens) / (self.max_rate * self.interval)).round();
        if wait <= 0.0 {
            state.tokens = (level + tokens).max(0.0);
            return Duration::ZERO;
        }
        wait_for(wait)
    }

    fn tokens(&self) -> f64 {
        self.state.lock().drain(self.max_rate, self.interval)
    }

    #[inline]
    fn burst(&self) -> f64 {
        self.max_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportError;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn leaky_bucket_arithmetic() {
        let lb = LeakyBucket::new(1.0, 10.0).unwrap();
        assert_eq!(lb.max_tokens(), 20.0);
        assert_eq!(lb.tokens(), 0.0);

        assert_eq!(lb.consume(10.0), Duration::ZERO);
        assert_eq!(lb.tokens(), 10.0);
        assert_eq!(lb.consume(10.0), Duration::ZERO);
        assert_eq!(lb.tokens(), 20.0);

        assert_eq!(lb.consume(20.0), 2 * SEC);
        assert_eq!(lb.tokens(), 20.0);

        lb.rewind(SEC);
        assert_eq!(lb.tokens(), 10.0);
        assert_eq!(lb.consume(20.0), SEC);

        lb.rewind(SEC);
        assert_eq!(lb.tokens(), 0.0);
        assert_eq!(lb.consume(15.0), Duration::ZERO);
        assert_eq!(lb.tokens(), 15.0);
    }

    #[test]
    fn update_drains_and_clamps() {
        let lb = LeakyBucket::new(1.0, 10.0).unwrap();
        lb.consume(15.0);
        assert_eq!(lb.update(5.0), 10.0);
        assert_eq!(lb.update(50.0), 0.0);
        assert_eq!(lb.tokens(), 0.0);
    }

    #[test]
    fn frequent_reads_keep_fractional_drain() {
        let lb = LeakyBucket::new(1.0, 10.0).unwrap();
        assert_eq!(lb.consume(10.0), Duration::ZERO);
        lb.rewind(Duration::from_millis(40));
        assert_eq!(lb.tokens(), 10.0);
        lb.rewind(Duration::from_millis(40));
        assert_eq!(lb.tokens(), 9.0);
    }

    #[test]
    fn empty_bucket_does_not_bank_time() {
        let lb = LeakyBucket::new(1.0, 10.0).unwrap();
        lb.rewind(5 * SEC);
        assert_eq!(lb.consume(20.0), Duration::ZERO);
        assert_eq!(lb.tokens(), 20.0);
    }

    #[test]
    fn custom_burst_rate() {
        let lb = LeakyBucket::with_burst_rate(2.0, 5.0, 1.0).unwrap();
        assert_eq!(lb.max_tokens(), 10.0);
        assert_eq!(lb.consume(10.0), Duration::ZERO);
        // (10 + 20 - 10) / (5 * 2)
        assert_eq!(lb.consume(20.0), 2 * SEC);
    }

    #[test]
    fn invalid_parameters() {
        assert!(matches!(
            LeakyBucket::new(0.0, 10.0),
            Err(TransportError::Config(_))
        ));
        assert!(LeakyBucket::new(1.0, 0.0).is_err());
        assert!(LeakyBucket::with_burst_rate(1.0, 1.0, -1.0).is_err());
    }
}
