//! Ordered admission pipeline: concurrency gate, keyed token bucket, adaptive limiter.

use std::sync::Arc;
use tracing::{debug, info};

use super::adaptive::AdaptiveLimiter;
use super::descriptor::{RateKey, RequestDescriptor};
use super::gate::ConcurrencyGate;
use super::keyed::KeyedTokenBucket;
use super::stage::{AdmissionStage, Ticket};
use crate::config::{AdmissionConfig, KeyBy};
use crate::error::{Rejection, RejectionKind};

/// Runs the three inner stages in order and stops at the first rejection.
pub struct AdmissionPipeline {
    /// `None` when `inflight_max <= 0`
    gate: Option<Arc<ConcurrencyGate>>,
    /// `None` when `rate_rps <= 0`
    buckets: Option<KeyedTokenBucket>,
    key_by: KeyBy,
    adaptive: Arc<AdaptiveLimiter>,
}

impl AdmissionPipeline {
    pub fn new(config: &AdmissionConfig, adaptive: Arc<AdaptiveLimiter>) -> Self {
        let gate = (config.inflight_max > 0).then(|| Arc::new(ConcurrencyGate::new(config.inflight_max)));
        let buckets = (config.rate_rps > 0.0)
            .then(|| KeyedTokenBucket::new(config.rate_rps, config.rate_burst));

        info!(
            inflight_max = config.inflight_max,
            rate_rps = config.rate_rps,
            rate_burst = config.rate_burst,
            key_by = ?config.key_by,
            adaptive = adaptive.is_enabled(),
            "Admission pipeline initialized"
        );

        Self {
            gate,
            buckets,
            key_by: config.key_by,
            adaptive,
        }
    }

    pub fn gate(&self) -> Option<&Arc<ConcurrencyGate>> {
        self.gate.as_ref()
    }

    pub fn buckets(&self) -> Option<&KeyedTokenBucket> {
        self.buckets.as_ref()
    }

    pub fn adaptive(&self) -> &Arc<AdaptiveLimiter> {
        &self.adaptive
    }

    fn reject(descriptor: &RequestDescriptor, kind: RejectionKind) -> Rejection {
        debug!(
            transport = %descriptor.transport,
            route = %descriptor.route,
            kind = ?kind,
            "Request rejected"
        );
        Rejection::new(kind)
    }
}

impl AdmissionStage for AdmissionPipeline {
    fn name(&self) -> &'static str {
        "admission"
    }

    fn admit(&self, descriptor: &RequestDescriptor) -> Result<Ticket, Rejection> {
        // 1) concurrency
        let permit = match &self.gate {
            Some(gate) => Some(
                gate.try_acquire()
                    .ok_or_else(|| Self::reject(descriptor, RejectionKind::Concurrency))?,
            ),
            None => None,
        };

        // 2) token bucket; an early return drops the permit
        if let Some(buckets) = &self.buckets {
            let key = RateKey::derive(self.key_by, descriptor).to_string_key();
            if !buckets.allow(&key) {
                return Err(Self::reject(descriptor, RejectionKind::Rate));
            }
        }

        // 3) adaptive
        let completion = self
            .adaptive
            .allow()
            .map_err(|rejection| Self::reject(descriptor, rejection.kind))?;

        Ok(Ticket::new(permit, Some(completion)))
    }
}
