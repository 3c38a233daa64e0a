//! Refresh lifecycle of the per-route quota table.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::client::QuotaAuthorityClient;
use super::table::{QuotaRecord, QuotaTable};
use crate::config::QuotaConfig;
use crate::error::{Result, TurnstileError};

/// What a refresh did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshOutcome {
    /// A fresh table from the authority was published
    Applied,
    /// The authority could not be used; the table was emptied
    Cleared,
}

/// Result of one refresh, as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub outcome: RefreshOutcome,
    pub routes_loaded: usize,
    pub took_ms: u64,
}

/// Keeps a [`QuotaTable`] in sync with the quota authority.
///
/// Failures never reject traffic: when the authority is unreachable or answers
/// with garbage the table is emptied, which lifts every route quota until the
/// next successful refresh.
pub struct RouteQuotas {
    client: QuotaAuthorityClient,
    table: Arc<QuotaTable>,
    refresh_interval: Duration,
    stop: CancellationToken,
}

impl RouteQuotas {
    /// Build from configuration. Fails fast on a missing project id.
    pub fn new(config: &QuotaConfig) -> Result<Self> {
        if config.project_id.trim().is_empty() {
            return Err(TurnstileError::Config(
                "quotas.project_id is required for per-route quotas".into(),
            ));
        }
        let client = QuotaAuthorityClient::new(
            &config.authority_url,
            &config.project_id,
            config.request_timeout(),
            config.retries,
        )?;
        let table = Arc::new(QuotaTable::new(config.match_mode, config.burst_factor));
        Ok(Self::with_client(client, table, config.refresh_interval()))
    }

    pub fn with_client(
        client: QuotaAuthorityClient,
        table: Arc<QuotaTable>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            client,
            table,
            refresh_interval,
            stop: CancellationToken::new(),
        }
    }

    pub fn table(&self) -> &Arc<QuotaTable> {
        &self.table
    }

    /// Whether a request to `route` fits its quota.
    pub fn allow(&self, route: &str) -> bool {
        self.table.allow(route)
    }

    /// Number of routes currently carrying a quota.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Fetch quotas once and publish the result.
    #[instrument(skip(self), fields(project = %self.client.project()))]
    pub async fn refresh_once(&self) -> RefreshReport {
        let started = Instant::now();
        let outcome = match self.client.fetch().await {
            Ok(items) => {
                let total = items.len();
                let records: Vec<QuotaRecord> = items
                    .iter()
                    .filter_map(|item| QuotaRecord::normalize(&item.route, item.quota, item.interval))
                    .collect();
                let skipped = total - records.len();
                let routes = self.table.apply(records);
                info!(routes = routes, skipped = skipped, "Route quotas applied");
                RefreshOutcome::Applied
            }
            Err(e) => {
                error!(error = %e, "Quota authority fetch failed");
                self.table.clear();
                warn!("Route quotas cleared: using empty set (fail-open)");
                RefreshOutcome::Cleared
            }
        };

        RefreshReport {
            outcome,
            routes_loaded: self.table.len(),
            took_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Refresh now, then every refresh interval, until `shutdown` is cancelled
    /// or [`stop`](Self::stop) is called.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = this.refresh_interval.as_secs(),
                "Starting route quota refresh loop"
            );
            // the first tick completes immediately
            let period = this.refresh_interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = this.stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = this.stop.cancelled() => break,
                    _ = this.refresh_once() => {}
                }
            }
            info!("Route quota refresh loop stopped");
        })
    }

    /// Stop the refresh loop. The loop cannot be restarted afterwards.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}
