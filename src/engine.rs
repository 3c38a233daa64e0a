//! The admission engine: one explicitly constructed instance per server.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::{
    AdaptiveLimiter, AdaptiveStats, AdmissionPipeline, AdmissionStage, Outcome, RequestDescriptor,
    SystemCpu, Ticket,
};
use crate::config::{QuotaOrder, TurnstileConfig};
use crate::error::{Rejection, Result};
use crate::quota::{RouteQuotaInterceptor, RouteQuotas};

/// Admission pipeline plus optional per-route quotas, chained in configured order.
pub struct Engine {
    pipeline: Arc<AdmissionPipeline>,
    quotas: Option<Arc<RouteQuotas>>,
    stages: Vec<Arc<dyn AdmissionStage>>,
}

impl Engine {
    /// Build an engine from validated configuration.
    ///
    /// Background work (utilization sampling, quota refresh) does not run
    /// until [`start`](Self::start) is called.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;

        let adaptive = if config.adaptive.enabled {
            let source = Arc::new(SystemCpu::new(config.adaptive.cpu_quota));
            AdaptiveLimiter::new(&config.adaptive, source)
        } else {
            AdaptiveLimiter::disabled()
        };
        let pipeline = AdmissionPipeline::new(&config.admission, Arc::new(adaptive));

        let quotas = if config.quotas.enabled {
            Some(Arc::new(RouteQuotas::new(&config.quotas)?))
        } else {
            None
        };

        Ok(Self::new(pipeline, quotas, config.quotas.order))
    }

    pub fn new(pipeline: AdmissionPipeline, quotas: Option<Arc<RouteQuotas>>, order: QuotaOrder) -> Self {
        let pipeline = Arc::new(pipeline);
        let mut stages: Vec<Arc<dyn AdmissionStage>> = vec![pipeline.clone() as Arc<dyn AdmissionStage>];
        if let Some(quotas) = &quotas {
            let interceptor = Arc::new(RouteQuotaInterceptor::new(Arc::clone(quotas.table())));
            match order {
                QuotaOrder::Before => stages.insert(0, interceptor),
                QuotaOrder::After => stages.push(interceptor),
            }
        }

        info!(
            stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Admission engine assembled"
        );

        Self {
            pipeline,
            quotas,
            stages,
        }
    }

    pub fn pipeline(&self) -> &Arc<AdmissionPipeline> {
        &self.pipeline
    }

    /// Route quotas, when enabled.
    pub fn quotas(&self) -> Option<&Arc<RouteQuotas>> {
        self.quotas.as_ref()
    }

    pub fn adaptive_stats(&self) -> AdaptiveStats {
        self.pipeline.adaptive().stats()
    }

    /// Run every stage in order, stopping at the first rejection.
    ///
    /// Tickets of stages that already admitted are released when a later
    /// stage rejects.
    pub fn admit(&self, descriptor: &RequestDescriptor) -> std::result::Result<Admission, Rejection> {
        let mut tickets = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            tickets.push(stage.admit(descriptor)?);
        }
        Ok(Admission { tickets })
    }

    /// Admit, run `handler`, and report its outcome.
    pub async fn run<F, T, E>(
        &self,
        descriptor: &RequestDescriptor,
        handler: F,
    ) -> std::result::Result<std::result::Result<T, E>, Rejection>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        let admission = self.admit(descriptor)?;
        let result = handler.await;
        admission.complete(match &result {
            Ok(_) => Outcome::Success,
            Err(_) => Outcome::Failure,
        });
        Ok(result)
    }

    /// Spawn the background tasks: utilization sampling when the adaptive
    /// stage is on, and the quota refresh loop when quotas are on.
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let adaptive = self.pipeline.adaptive();
        if adaptive.is_enabled() {
            handles.push(adaptive.spawn_sampler(shutdown.clone()));
        }
        if let Some(quotas) = &self.quotas {
            handles.push(quotas.start(shutdown));
        }
        handles
    }

    /// Stop the quota refresh loop. Sampling stops with the shutdown token.
    pub fn stop(&self) {
        if let Some(quotas) = &self.quotas {
            quotas.stop();
        }
    }
}

/// An admitted request.
///
/// Call [`complete`](Self::complete) once the handler finishes. Dropping the
/// admission without completing it releases everything and counts as a
/// failure.
#[derive(Debug)]
#[must_use = "dropping an admission immediately releases it"]
pub struct Admission {
    tickets: Vec<Ticket>,
}

impl Admission {
    pub fn complete(self, outcome: Outcome) {
        for ticket in self.tickets {
            ticket.complete(outcome);
        }
    }
}
