//! Per-key token buckets sharing one rate and burst.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::bucket::{BucketParams, TokenBucket};
use super::descriptor::GLOBAL_KEY;

/// Token bucket limiter keyed by an arbitrary string.
///
/// Buckets are created on first use and live as long as the limiter. The map
/// shard lock is only taken to look up or insert a bucket; taking a token
/// happens on the bucket itself without any lock.
pub struct KeyedTokenBucket {
    buckets: DashMap<String, Arc<TokenBucket>>,
    params: BucketParams,
}

impl KeyedTokenBucket {
    /// Create a limiter; `burst` below 1 is treated as 1.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            params: BucketParams::new(rate, burst),
        }
    }

    /// Take one token from the bucket for `key` (`"global"` when empty).
    pub fn allow(&self, key: &str) -> bool {
        let key = if key.is_empty() { GLOBAL_KEY } else { key };
        let allowed = self.bucket(key).try_acquire();
        if !allowed {
            trace!(key = %key, "Token bucket empty");
        }
        allowed
    }

    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(
                key = %key,
                rate = self.params.rate,
                burst = self.params.burst,
                "Creating token bucket"
            );
            Arc::new(TokenBucket::with_params(self.params))
        });
        Arc::clone(entry.value())
    }

    /// Number of distinct keys seen so far.
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn params(&self) -> BucketParams {
        self.params
    }
}
