//! Lock-free cap on simultaneous in-flight requests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Caps the number of requests in flight at once.
///
/// `current` only moves through a compare-and-swap that checks the bound,
/// so it stays within `[0, max]` for every interleaving of callers.
#[derive(Debug)]
pub struct ConcurrencyGate {
    max: i64,
    current: AtomicI64,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `max` requests at once (minimum 1).
    pub fn new(max: i64) -> Self {
        Self {
            max: max.max(1),
            current: AtomicI64::new(0),
        }
    }

    /// Take a slot if one is free. Never blocks.
    pub fn try_enter(&self) -> bool {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a slot taken by a successful [`try_enter`](Self::try_enter).
    pub fn leave(&self) {
        let previous = self.current.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "leave() without matching try_enter()");
    }

    /// Take a slot that is released when the returned permit drops.
    pub fn try_acquire(self: &Arc<Self>) -> Option<GatePermit> {
        if self.try_enter() {
            Some(GatePermit {
                gate: Arc::clone(self),
            })
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> i64 {
        self.max
    }
}

/// A held gate slot. Dropping it calls [`ConcurrencyGate::leave`] exactly once,
/// including when the handler panics or its future is cancelled.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
