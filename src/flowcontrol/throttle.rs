use std::{
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use super::RateLimiter;

const SMOOTHING: f64 = 0.1;

/// Blocking front-end for a [`RateLimiter`], meant to be called from a
/// transfer's progress callback before each chunk of I/O.
#[derive(Debug)]
pub struct Throttle<L> {
    limiter: L,
    stats: Mutex<Stats>,
}

#[derive(Debug, Default)]
struct Stats {
    last_update: Option<Instant>,
    avg_rate: Option<f64>,
    total: f64,
}

impl<L: RateLimiter> Throttle<L> {
    pub fn new(limiter: L) -> Self {
        Self {
            limiter,
            stats: Mutex::new(Stats::default()),
        }
    }

    #[inline]
    pub fn limiter(&self) -> &L {
        &self.limiter
    }

    /// Sleep until the limiter admits `units`, then record them.
    /// Requests above the limiter's burst are admitted piecewise.
    /// Returns the time spent sleeping.
    pub fn acquire(&self, units: f64) -> Duration {
        let burst = self.limiter.burst();
        let mut remaining = units;
        let mut slept = Duration::ZERO;
        while remaining > 0.0 {
            let chunk = if burst > 0.0 {
                remaining.min(burst)
            } else {
                remaining
            };
            loop {
                let wait = self.limiter.consume(chunk);
                if wait.is_zero() {
                    break;
                }
                #[cfg(feature = "logging")]
                tracing::trace!("throttled for {:?}", wait);
                thread::sleep(wait);
                slept += wait;
            }
            remaining -= chunk;
        }
        self.record(units);
        slept
    }

    /// Record `units` transferred since the previous call, updating the
    /// smoothed rate.
    pub fn record(&self, units: f64) {
        let now = Instant::now();
        let mut stats = self.stats.lock();
        stats.total += units;
        if let Some(last) = stats.last_update {
            let elapsed = now.duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let sample = units / elapsed;
                stats.avg_rate = Some(match stats.avg_rate {
                    Some(avg) => (1.0 - SMOOTHING) * avg + SMOOTHING * sample,
                    None => sample,
                });
            }
        }
        stats.last_update = Some(now);
    }

    /// Smoothed units per second, once at least two chunks were recorded.
    #[inline]
    pub fn rate(&self) -> Option<f64> {
        self.stats.lock().avg_rate
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.stats.lock().total
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::flowcontrol::{LeakyBucket, TokenBucket};

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn acquire_with_tokens_never_sleeps() {
        let throttle = Throttle::new(TokenBucket::new(1024.0, 1.0).unwrap());
        assert_eq!(throttle.acquire(256.0), Duration::ZERO);
        assert_eq!(throttle.rate(), None);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(throttle.acquire(256.0), Duration::ZERO);

        assert_eq!(throttle.total(), 512.0);
        assert!(throttle.rate().unwrap() > 0.0);
        assert_eq!(throttle.limiter().tokens(), 512.0);
    }

    #[test]
    fn acquire_above_capacity_is_split() {
        let throttle = Arc::new(Throttle::new(TokenBucket::new(100.0, 1000.0).unwrap()));
        // In one piece this would wait forever: the bucket never holds 1000.
        assert_eq!(throttle.limiter().consume(1000.0), SEC);

        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker = throttle.clone();
        thread::spawn(move || {
            let _ = tx.send(worker.acquire(1000.0));
        });
        let slept = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(slept >= SEC);
        assert_eq!(throttle.total(), 1000.0);
    }

    #[test]
    fn leaky_bucket_burst_bounds_chunks() {
        let bucket = LeakyBucket::new(1.0, 10.0).unwrap();
        assert_eq!(bucket.burst(), 20.0);
        let throttle = Throttle::new(bucket);
        assert_eq!(throttle.acquire(20.0), Duration::ZERO);
        assert_eq!(throttle.limiter().tokens(), 20.0);
    }

    #[test]
    fn rate_is_smoothed() {
        let throttle = Throttle::new(TokenBucket::new(1.0, 1.0).unwrap());
        throttle.record(0.0);
        thread::sleep(Duration::from_millis(10));
        throttle.record(100.0);
        let first = throttle.rate().unwrap();
        thread::sleep(Duration::from_millis(10));
        throttle.record(0.0);
        let second = throttle.rate().unwrap();
        assert!(second < first);
        assert!(second >= 0.9 * first - f64::EPSILON);
    }
}
