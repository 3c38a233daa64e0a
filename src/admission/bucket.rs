//! Token bucket implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Rate and capacity of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Tokens added per second
    pub rate: f64,
    /// Maximum tokens held (at least 1)
    pub burst: u32,
}

impl BucketParams {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: burst.max(1),
        }
    }
}

/// A token bucket limiter.
///
/// Tracks the theoretical arrival time of the next token (GCRA) in a single
/// atomic, so taking a token is a compare-and-swap loop with no lock.
#[derive(Debug)]
pub struct TokenBucket {
    params: BucketParams,
    /// Nanoseconds between two tokens
    emission: u64,
    /// How far ahead of now the arrival time may run before rejecting
    tolerance: u64,
    /// Reference point for the arrival time
    origin: Instant,
    /// Theoretical arrival time, in nanoseconds since `origin`
    tat: AtomicU64,
}

impl TokenBucket {
    /// Create a full bucket. `burst` below 1 is treated as 1.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_params(BucketParams::new(rate, burst))
    }

    pub fn with_params(params: BucketParams) -> Self {
        let params = BucketParams::new(params.rate, params.burst);
        let emission = if params.rate > 0.0 && params.rate.is_finite() {
            ((NANOS_PER_SEC / params.rate) as u64).max(1)
        } else {
            // never refills; the tolerance must still fit in the clock range
            (u64::MAX / 4) / u64::from(params.burst)
        };
        let tolerance = emission.saturating_mul(u64::from(params.burst) - 1);

        Self {
            params,
            emission,
            tolerance,
            origin: Instant::now(),
            tat: AtomicU64::new(0),
        }
    }

    /// Take one token if available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let now = self.now();
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let base = tat.max(now);
            if base - now > self.tolerance {
                return false;
            }
            match self.tat.compare_exchange_weak(
                tat,
                base.saturating_add(self.emission),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => tat = actual,
            }
        }
    }

    pub fn params(&self) -> BucketParams {
        self.params
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}
