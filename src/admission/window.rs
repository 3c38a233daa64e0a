//! Rolling time window of completion statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One time slice of the window.
#[derive(Debug, Default)]
struct Slot {
    /// Slice number this slot currently holds (0 = never used)
    slice: AtomicU64,
    passed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    /// Sum of completion latencies in milliseconds
    rt_total: AtomicU64,
}

impl Slot {
    fn reset(&self) {
        self.passed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.rt_total.store(0, Ordering::Relaxed);
    }
}

/// Aggregate over the completed slices of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSummary {
    /// Highest number of completions seen in a single slice
    pub max_pass: u64,
    /// Lowest average completion latency of any slice, in milliseconds
    pub min_rt_ms: Option<u64>,
    pub passed: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// A ring of `n` slots covering a rolling window.
///
/// Time is cut into slices of `window / n`; slice `k` is recorded in slot
/// `k % n`. The first writer of a new slice claims the slot and clears it, so
/// writers only ever touch the slot of the current slice and never share a lock.
#[derive(Debug)]
pub struct RollingWindow {
    origin: Instant,
    slice_nanos: u64,
    slots: Box<[Slot]>,
}

impl RollingWindow {
    pub fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        let slice_nanos = (window.as_nanos() as u64 / buckets as u64).max(1);
        Self {
            origin: Instant::now(),
            slice_nanos,
            slots: (0..buckets).map(|_| Slot::default()).collect(),
        }
    }

    /// Length of one slice.
    pub fn slice_duration(&self) -> Duration {
        Duration::from_nanos(self.slice_nanos)
    }

    pub fn buckets(&self) -> usize {
        self.slots.len()
    }

    /// Record a finished request and its latency.
    pub fn record_completion(&self, rt_ms: u64, success: bool) {
        let slot = self.current_slot();
        if success {
            slot.passed.fetch_add(1, Ordering::Relaxed);
        } else {
            slot.failed.fetch_add(1, Ordering::Relaxed);
        }
        slot.rt_total.fetch_add(rt_ms, Ordering::Relaxed);
    }

    /// Record a request that was turned away.
    pub fn record_drop(&self) {
        self.current_slot().dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Summarize every completed slice still inside the window.
    ///
    /// The slice in progress is left out so a half-filled slot does not drag
    /// the throughput estimate down.
    pub fn summary(&self) -> WindowSummary {
        let current = self.current_slice();
        let n = self.slots.len() as u64;
        let mut summary = WindowSummary::default();

        for slot in self.slots.iter() {
            let slice = slot.slice.load(Ordering::Acquire);
            if slice == 0 || slice >= current || current - slice >= n {
                continue;
            }
            let passed = slot.passed.load(Ordering::Relaxed);
            let failed = slot.failed.load(Ordering::Relaxed);
            let completions = passed + failed;

            summary.passed += passed;
            summary.failed += failed;
            summary.dropped += slot.dropped.load(Ordering::Relaxed);
            summary.max_pass = summary.max_pass.max(completions);

            if completions > 0 {
                let avg = slot.rt_total.load(Ordering::Relaxed).div_ceil(completions);
                summary.min_rt_ms = Some(summary.min_rt_ms.map_or(avg, |min| min.min(avg)));
            }
        }
        summary
    }

    fn current_slice(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64 / self.slice_nanos + 1
    }

    fn current_slot(&self) -> &Slot {
        let slice = self.current_slice();
        let slot = &self.slots[(slice % self.slots.len() as u64) as usize];
        let seen = slot.slice.load(Ordering::Acquire);
        if seen < slice
            && slot
                .slice
                .compare_exchange(seen, slice, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            slot.reset();
        }
        slot
    }
}
