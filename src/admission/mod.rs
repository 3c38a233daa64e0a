//! Admission control: concurrency, rate and adaptive load shedding.

mod adaptive;
mod bucket;
mod cpu;
mod descriptor;
mod gate;
mod keyed;
mod pipeline;
mod stage;
mod window;

pub use adaptive::{AdaptiveLimiter, AdaptiveStats, CompletionToken, Outcome};
pub use bucket::{BucketParams, TokenBucket};
pub use cpu::{StaticUtilization, SystemCpu, UtilizationSource, FULL_UTILIZATION};
pub use descriptor::{canonical_route, RateKey, RequestDescriptor, TransportKind, GLOBAL_KEY};
pub use gate::{ConcurrencyGate, GatePermit};
pub use keyed::KeyedTokenBucket;
pub use pipeline::AdmissionPipeline;
pub use stage::{AdmissionStage, Ticket};
pub use window::{RollingWindow, WindowSummary};
