//! Transport adapters: tower middleware for HTTP and gRPC servers.

mod layer;

use std::net::SocketAddr;

use crate::admission::{RequestDescriptor, TransportKind};

pub use layer::{AdmissionLayer, AdmissionService};

/// Header (and gRPC metadata key) carrying the rejection reason code.
pub const REASON_HEADER: &str = "x-ratelimit-reason";
/// Header consulted for the caller identity when no [`CallerId`] extension is set.
pub const USER_ID_HEADER: &str = "x-user-id";

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const REAL_IP_HEADER: &str = "x-real-ip";

/// Caller identity resolved by an upstream authentication layer.
///
/// Insert it into the request extensions before the admission layer runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

/// Build a request descriptor from an inbound HTTP request.
pub fn describe<B>(transport: TransportKind, request: &http::Request<B>) -> RequestDescriptor {
    let headers = request.headers();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut descriptor = RequestDescriptor::new(transport, request.uri().path());
    descriptor.forwarded_for = header(FORWARDED_FOR_HEADER);
    descriptor.real_ip = header(REAL_IP_HEADER);
    descriptor.peer_addr = peer_addr(request).map(|addr| addr.to_string());
    descriptor.caller_id = request
        .extensions()
        .get::<CallerId>()
        .map(|caller| caller.0.clone())
        .filter(|id| !id.is_empty())
        .or_else(|| header(USER_ID_HEADER));
    descriptor
}

fn peer_addr<B>(request: &http::Request<B>) -> Option<SocketAddr> {
    let extensions = request.extensions();
    extensions.get::<SocketAddr>().copied().or_else(|| {
        extensions
            .get::<tonic::transport::server::TcpConnectInfo>()
            .and_then(|info| info.remote_addr())
    })
}
