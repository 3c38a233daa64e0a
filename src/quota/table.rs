//! Per-route quota table published as an immutable snapshot.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::admission::{canonical_route, BucketParams, TokenBucket};
use crate::config::MatchMode;

/// Quota for one route: `quota` requests every `interval_secs` seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRecord {
    pub route: String,
    pub quota: u64,
    pub interval_secs: u64,
}

impl QuotaRecord {
    /// Normalize raw values from the authority.
    ///
    /// Returns `None` for non-positive quotas and unroutable paths. An
    /// interval of zero or less is treated as one second.
    pub fn normalize(route: &str, quota: i64, interval: i64) -> Option<Self> {
        let route = canonical_route(route);
        if route.is_empty() || quota <= 0 {
            return None;
        }
        Some(Self {
            route,
            quota: quota as u64,
            interval_secs: interval.max(1) as u64,
        })
    }

    /// Token bucket parameters derived from this quota.
    pub fn bucket_params(&self, burst_factor: f64) -> BucketParams {
        let rate = self.quota as f64 / self.interval_secs as f64;
        let burst = (self.quota as f64 * burst_factor).floor().max(1.0);
        BucketParams::new(rate, burst.min(u32::MAX as f64) as u32)
    }
}

#[derive(Debug)]
struct QuotaEntry {
    record: QuotaRecord,
    limiter: Arc<TokenBucket>,
}

/// One published version of the table. Never mutated after publication.
#[derive(Debug, Default)]
pub struct QuotaSnapshot {
    entries: HashMap<String, QuotaEntry>,
}

impl QuotaSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, route: &str) -> Option<&QuotaRecord> {
        self.entries.get(route).map(|entry| &entry.record)
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn find(&self, route: &str, mode: MatchMode) -> Option<&QuotaEntry> {
        if let Some(entry) = self.entries.get(route) {
            return Some(entry);
        }
        match mode {
            MatchMode::Strict => None,
            MatchMode::Prefix => self
                .entries
                .iter()
                .filter(|(prefix, _)| is_route_prefix(prefix, route))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, entry)| entry),
        }
    }
}

/// Whether `prefix` covers `route`. Plain string prefix, not segment aware.
fn is_route_prefix(prefix: &str, route: &str) -> bool {
    route.starts_with(prefix)
}

/// Route quota lookup table.
///
/// Readers load the current snapshot without locking. Writers build a complete
/// replacement and swap it in, so a reader sees either the old table or the
/// new one, never a mix. Limiters of routes missing from the new snapshot are
/// dropped with the old one.
pub struct QuotaTable {
    snapshot: ArcSwap<QuotaSnapshot>,
    /// Serializes writers (periodic refresh and on-demand refresh)
    write_lock: Mutex<()>,
    match_mode: MatchMode,
    burst_factor: f64,
}

impl QuotaTable {
    pub fn new(match_mode: MatchMode, burst_factor: f64) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(QuotaSnapshot::default()),
            write_lock: Mutex::new(()),
            match_mode,
            burst_factor,
        }
    }

    /// Replace the table with `records` and return the new route count.
    ///
    /// A route whose derived rate and burst are unchanged keeps its existing
    /// limiter, and with it the tokens already spent.
    pub fn apply(&self, records: impl IntoIterator<Item = QuotaRecord>) -> usize {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load();

        let mut entries = HashMap::new();
        for record in records {
            let params = record.bucket_params(self.burst_factor);
            let limiter = match current.entries.get(&record.route) {
                Some(existing) if existing.limiter.params() == params => Arc::clone(&existing.limiter),
                _ => {
                    debug!(
                        route = %record.route,
                        rate = params.rate,
                        burst = params.burst,
                        "Creating route limiter"
                    );
                    Arc::new(TokenBucket::with_params(params))
                }
            };
            entries.insert(record.route.clone(), QuotaEntry { record, limiter });
        }

        let len = entries.len();
        self.snapshot.store(Arc::new(QuotaSnapshot { entries }));
        len
    }

    /// Publish an empty table, dropping every route limiter.
    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.snapshot.store(Arc::new(QuotaSnapshot::default()));
    }

    /// Whether a request to `route` fits its quota. Unknown routes pass.
    pub fn allow(&self, route: &str) -> bool {
        let route = canonical_route(route);
        if route.is_empty() {
            return true;
        }
        let snapshot = self.snapshot.load();
        if snapshot.is_empty() {
            return true;
        }
        match snapshot.find(&route, self.match_mode) {
            Some(entry) => {
                let allowed = entry.limiter.try_acquire();
                if !allowed {
                    trace!(route = %route, matched = %entry.record.route, "Route quota exhausted");
                }
                allowed
            }
            None => true,
        }
    }

    /// The quota record that applies to `route`, if any.
    pub fn lookup(&self, route: &str) -> Option<QuotaRecord> {
        let route = canonical_route(route);
        self.snapshot
            .load()
            .find(&route, self.match_mode)
            .map(|entry| entry.record.clone())
    }

    /// Number of routes with a quota.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<QuotaSnapshot> {
        self.snapshot.load_full()
    }

    /// Limiter currently attached to an exact route, for identity checks.
    #[cfg(test)]
    fn limiter(&self, route: &str) -> Option<Arc<TokenBucket>> {
        self.snapshot
            .load()
            .entries
            .get(route)
            .map(|entry| Arc::clone(&entry.limiter))
    }
}
