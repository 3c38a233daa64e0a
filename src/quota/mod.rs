//! Per-route quotas pulled from an external authority.

mod client;
mod interceptor;
mod manager;
mod table;

pub use client::{QuotaAuthorityClient, QuotaItem, QuotaResponse};
pub use interceptor::RouteQuotaInterceptor;
pub use manager::{RefreshOutcome, RefreshReport, RouteQuotas};
pub use table::{QuotaRecord, QuotaSnapshot, QuotaTable};
