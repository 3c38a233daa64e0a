//! Feedback-driven congestion limiter.
//!
//! Sheds load once smoothed utilization crosses a threshold *and* the number of
//! requests in flight exceeds what the service has recently shown it can
//! sustain. The sustainable concurrency is estimated from the rolling window as
//! `max_pass_per_slice * min_latency_ms * slices_per_second / 1000`, i.e. the
//! best observed throughput multiplied by the best observed latency.
//!
//! After a drop the estimate keeps being enforced for a short cool-down even if
//! utilization falls back below the threshold, so the limiter does not flap.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::cpu::UtilizationSource;
use super::window::RollingWindow;
use crate::config::AdaptiveConfig;
use crate::error::{Rejection, RejectionKind};

/// Weight of the previous value in the utilization moving average.
const UTILIZATION_DECAY: f64 = 0.95;
/// How long the concurrency estimate stays enforced after a drop.
const COOL_DOWN: Duration = Duration::from_secs(1);

/// Result of an admitted request, fed back into the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Point-in-time view of the limiter for health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdaptiveStats {
    pub enabled: bool,
    /// Smoothed utilization, per-mille
    pub utilization: u64,
    pub threshold: u64,
    pub in_flight: i64,
    pub max_pass: u64,
    pub min_rt_ms: u64,
    /// Current admissible concurrency estimate
    pub max_in_flight: u64,
    pub dropped: u64,
}

/// Adaptive congestion limiter.
pub struct AdaptiveLimiter {
    enabled: bool,
    threshold: u64,
    window: RollingWindow,
    slices_per_second: f64,
    in_flight: AtomicI64,
    /// Smoothed utilization, stored as `f64` bits
    utilization: AtomicU64,
    /// Nanoseconds since `origin` of the last drop (0 = not cooling down)
    last_drop: AtomicU64,
    origin: Instant,
    source: Arc<dyn UtilizationSource>,
    sample_interval: Duration,
}

impl AdaptiveLimiter {
    pub fn new(config: &AdaptiveConfig, source: Arc<dyn UtilizationSource>) -> Self {
        let window = RollingWindow::new(config.window(), config.buckets);
        let slices_per_second = 1.0 / window.slice_duration().as_secs_f64();
        Self {
            enabled: config.enabled,
            threshold: config.threshold,
            window,
            slices_per_second,
            in_flight: AtomicI64::new(0),
            utilization: AtomicU64::new(0f64.to_bits()),
            last_drop: AtomicU64::new(0),
            origin: Instant::now(),
            source,
            sample_interval: config.sample_interval(),
        }
    }

    /// A limiter that admits everything.
    pub fn disabled() -> Self {
        Self::new(
            &AdaptiveConfig::disabled(),
            Arc::new(super::cpu::StaticUtilization::default()),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Admit or shed one request.
    ///
    /// The returned token must be completed with the request outcome; if it is
    /// dropped instead, the request is recorded as a failure.
    pub fn allow(self: &Arc<Self>) -> Result<CompletionToken, Rejection> {
        if !self.enabled {
            return Ok(CompletionToken { inner: None });
        }
        if self.should_drop() {
            self.window.record_drop();
            debug!(
                in_flight = self.in_flight.load(Ordering::Relaxed),
                utilization = self.utilization(),
                "Adaptive limiter shedding load"
            );
            return Err(Rejection::new(RejectionKind::Adaptive));
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(CompletionToken {
            inner: Some(Pending {
                limiter: Arc::clone(self),
                started: Instant::now(),
            }),
        })
    }

    fn should_drop(&self) -> bool {
        let now = self.elapsed_nanos();
        let in_flight = self.in_flight.load(Ordering::Acquire);

        if self.utilization() < self.threshold {
            let last_drop = self.last_drop.load(Ordering::Acquire);
            if last_drop == 0 {
                return false;
            }
            if now.saturating_sub(last_drop) <= COOL_DOWN.as_nanos() as u64 {
                return in_flight > 1 && in_flight as u64 > self.max_in_flight();
            }
            self.last_drop.store(0, Ordering::Release);
            return false;
        }

        let drop = in_flight > 1 && in_flight as u64 > self.max_in_flight();
        if drop {
            // start the cool-down only on the first drop of a burst
            let _ = self
                .last_drop
                .compare_exchange(0, now.max(1), Ordering::AcqRel, Ordering::Acquire);
        }
        drop
    }

    /// Estimated number of requests the service can have in flight.
    pub fn max_in_flight(&self) -> u64 {
        let summary = self.window.summary();
        let max_pass = summary.max_pass.max(1) as f64;
        let min_rt = summary.min_rt_ms.unwrap_or(1).max(1) as f64;
        (max_pass * min_rt * self.slices_per_second / 1000.0).ceil() as u64
    }

    /// Smoothed utilization in per-mille.
    pub fn utilization(&self) -> u64 {
        f64::from_bits(self.utilization.load(Ordering::Acquire)).round() as u64
    }

    /// Take one utilization sample and fold it into the moving average.
    pub fn sample_once(&self) {
        let sample = self.source.sample() as f64;
        let previous = f64::from_bits(self.utilization.load(Ordering::Acquire));
        let smoothed = previous * UTILIZATION_DECAY + sample * (1.0 - UTILIZATION_DECAY);
        self.utilization.store(smoothed.to_bits(), Ordering::Release);
        trace!(sample = sample, smoothed = smoothed, "Utilization sampled");
    }

    /// Sample utilization periodically until `shutdown` is cancelled.
    pub fn spawn_sampler(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.sample_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Utilization sampler stopped");
                        return;
                    }
                    _ = ticker.tick() => limiter.sample_once(),
                }
            }
        })
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AdaptiveStats {
        let summary = self.window.summary();
        AdaptiveStats {
            enabled: self.enabled,
            utilization: self.utilization(),
            threshold: self.threshold,
            in_flight: self.in_flight(),
            max_pass: summary.max_pass,
            min_rt_ms: summary.min_rt_ms.unwrap_or(0),
            max_in_flight: self.max_in_flight(),
            dropped: summary.dropped,
        }
    }

    fn complete(&self, started: Instant, outcome: Outcome) {
        let rt_ms = started.elapsed().as_millis() as u64;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.window
            .record_completion(rt_ms, outcome == Outcome::Success);
    }

    fn elapsed_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

struct Pending {
    limiter: Arc<AdaptiveLimiter>,
    started: Instant,
}

/// Completion callback for an admitted request.
#[must_use = "an admitted request must report its outcome"]
pub struct CompletionToken {
    inner: Option<Pending>,
}

impl CompletionToken {
    /// Report the request outcome. Consumes the token so it runs at most once.
    pub fn done(mut self, outcome: Outcome) {
        if let Some(pending) = self.inner.take() {
            pending.limiter.complete(pending.started, outcome);
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if let Some(pending) = self.inner.take() {
            pending.limiter.complete(pending.started, Outcome::Failure);
        }
    }
}

impl std::fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionToken")
            .field("pending", &self.inner.is_some())
            .finish()
    }
}
