//! Request descriptors and rate key derivation.

use crate::config::KeyBy;

/// Key used when no finer grouping applies.
pub const GLOBAL_KEY: &str = "global";

/// The kind of transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Request/response (HTTP)
    Http,
    /// Bidirectional RPC (gRPC)
    Grpc,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "HTTP"),
            TransportKind::Grpc => write!(f, "gRPC"),
        }
    }
}

/// Everything the engine needs to know about an inbound request.
///
/// Built by the transport layer; the engine never sees credentials, only a
/// caller id that something upstream already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub transport: TransportKind,
    /// Request path or `/package.Service/Method`
    pub route: String,
    /// Raw forwarded-for header value (may be a comma separated list)
    pub forwarded_for: Option<String>,
    /// Raw real-address header value
    pub real_ip: Option<String>,
    /// Address of the connected peer
    pub peer_addr: Option<String>,
    /// Authenticated caller identity, if resolved
    pub caller_id: Option<String>,
}

impl RequestDescriptor {
    pub fn new(transport: TransportKind, route: impl Into<String>) -> Self {
        Self {
            transport,
            route: route.into(),
            forwarded_for: None,
            real_ip: None,
            peer_addr: None,
            caller_id: None,
        }
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    pub fn with_real_ip(mut self, value: impl Into<String>) -> Self {
        self.real_ip = Some(value.into());
        self
    }

    pub fn with_peer_addr(mut self, value: impl Into<String>) -> Self {
        self.peer_addr = Some(value.into());
        self
    }

    pub fn with_caller_id(mut self, value: impl Into<String>) -> Self {
        self.caller_id = Some(value.into());
        self
    }

    /// Best known caller address: forwarded header, then real-address
    /// header, then the peer. Lists yield their first entry.
    pub fn client_address(&self) -> Option<String> {
        [&self.forwarded_for, &self.real_ip]
            .into_iter()
            .flatten()
            .find_map(|raw| first_entry(raw))
            .map(str::to_string)
            .or_else(|| self.peer_addr.as_deref().and_then(peer_host).map(str::to_string))
    }
}

fn first_entry(raw: &str) -> Option<&str> {
    let first = raw.split(',').next()?.trim();
    (!first.is_empty()).then_some(first)
}

/// Host part of a `host:port` / `[v6]:port` peer address.
fn peer_host(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(addr) = raw.parse::<std::net::SocketAddr>() {
        // re-slice the input to avoid allocating
        return match addr {
            std::net::SocketAddr::V4(_) => raw.rsplit_once(':').map(|(host, _)| host),
            std::net::SocketAddr::V6(_) => raw
                .strip_prefix('[')
                .and_then(|rest| rest.split_once(']'))
                .map(|(host, _)| host),
        };
    }
    Some(raw)
}

/// A token bucket key derived from a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    Global,
    Address(String),
    Caller(String),
}

impl RateKey {
    /// Derive the key for `descriptor` under `policy`.
    pub fn derive(policy: KeyBy, descriptor: &RequestDescriptor) -> Self {
        match policy {
            KeyBy::Global => RateKey::Global,
            KeyBy::Address => Self::address(descriptor),
            KeyBy::Caller => match descriptor.caller_id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => RateKey::Caller(id.to_string()),
                _ => Self::address(descriptor),
            },
        }
    }

    fn address(descriptor: &RequestDescriptor) -> Self {
        RateKey::Address(
            descriptor
                .client_address()
                .unwrap_or_else(|| "unknown".to_string()),
        )
    }

    /// String form used as the bucket map key.
    pub fn to_string_key(&self) -> String {
        match self {
            RateKey::Global => GLOBAL_KEY.to_string(),
            RateKey::Address(addr) => format!("ip:{}", addr),
            RateKey::Caller(id) => format!("u:{}", id),
        }
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Canonical form of a route: leading `/`, no trailing `/`, no query.
///
/// Returns an empty string when nothing routable is left.
pub fn canonical_route(raw: &str) -> String {
    let path = raw.split(['?', '#']).next().unwrap_or_default().trim();
    if path.is_empty() {
        return String::new();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
