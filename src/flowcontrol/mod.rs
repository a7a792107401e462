//! Bandwidth limiting.
//!
//! Both buckets share one contract: `consume(n)` either admits `n` units,
//! commits them and returns a zero wait, or returns the (whole second) wait
//! after which asking again should succeed, leaving the bucket untouched.
mod leaky_bucket;
mod throttle;
mod token_bucket;

use std::time::Duration;

pub use leaky_bucket::LeakyBucket;
pub use throttle::Throttle;
pub use token_bucket::TokenBucket;

pub trait RateLimiter {
    /// Try to take `tokens` units. A zero duration means they were taken.
    fn consume(&self, tokens: f64) -> Duration;

    /// Current level, brought up to date with the elapsed time.
    fn tokens(&self) -> f64;

    /// Largest request `consume` can ever admit in one call.
    fn burst(&self) -> f64;
}

impl<L: RateLimiter + ?Sized> RateLimiter for &L {
    #[inline]
    fn consume(&self, tokens: f64) -> Duration {
        (**self).consume(tokens)
    }

    #[inline]
    fn tokens(&self) -> f64 {
        (**self).tokens()
    }

    #[inline]
    fn burst(&self) -> f64 {
        (**self).burst()
    }
}

impl<L: RateLimiter + ?Sized> RateLimiter for std::sync::Arc<L> {
    #[inline]
    fn consume(&self, tokens: f64) -> Duration {
        (**self).consume(tokens)
    }

    #[inline]
    fn tokens(&self) -> f64 {
        (**self).tokens()
    }

    #[inline]
    fn burst(&self) -> f64 {
        (**self).burst()
    }
}

#[inline]
pub(crate) fn wait_for(seconds: f64) -> Duration {
    if seconds <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

pub(crate) fn positive(name: &str, value: f64) -> crate::Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(crate::TransportError::config(format!(
            "{name} must be a positive number, got {value}"
        )))
    }
}
