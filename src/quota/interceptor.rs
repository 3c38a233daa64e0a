//! Admission stage enforcing per-route quotas.

use std::sync::Arc;
use tracing::debug;

use super::table::QuotaTable;
use crate::admission::{AdmissionStage, RequestDescriptor, Ticket};
use crate::error::{Rejection, RejectionKind};

/// Rejects requests whose route has used up its quota.
///
/// Shares no state with the admission pipeline, so it can sit before or after it.
pub struct RouteQuotaInterceptor {
    table: Arc<QuotaTable>,
}

impl RouteQuotaInterceptor {
    pub fn new(table: Arc<QuotaTable>) -> Self {
        Self { table }
    }
}

impl AdmissionStage for RouteQuotaInterceptor {
    fn name(&self) -> &'static str {
        "route_quota"
    }

    fn admit(&self, descriptor: &RequestDescriptor) -> Result<Ticket, Rejection> {
        if self.table.allow(&descriptor.route) {
            return Ok(Ticket::empty());
        }
        debug!(
            transport = %descriptor.transport,
            route = %descriptor.route,
            "Request rejected by route quota"
        );
        Err(Rejection::new(RejectionKind::Quota))
    }
}
