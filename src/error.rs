//! Error types for the Turnstile engine.

use thiserror::Error;

/// Reason code reported for concurrency, token bucket and adaptive rejections.
pub const REASON_RATE_LIMITED: &str = "RATE_LIMITED";
/// Reason code reported for per-route quota rejections.
pub const REASON_QUOTA_RATE_LIMITED: &str = "QUOTA_RATE_LIMITED";

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration errors detected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Quota authority errors (absorbed by the refresh task)
    #[error("Quota authority error: {0}")]
    Authority(#[from] AuthorityFetchError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

/// Failure to obtain a usable quota list from the authority.
#[derive(Error, Debug)]
pub enum AuthorityFetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed response body: {0}")]
    Decode(String),
}

/// Which stage turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// The concurrency gate was full
    Concurrency,
    /// The keyed token bucket was empty
    Rate,
    /// The adaptive limiter is shedding load
    Adaptive,
    /// The per-route quota was exhausted
    Quota,
}

impl RejectionKind {
    /// Stable machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RejectionKind::Quota => REASON_QUOTA_RATE_LIMITED,
            _ => REASON_RATE_LIMITED,
        }
    }
}

/// The uniform "too many requests" outcome of an admission check.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("too many requests ({})", .kind.reason_code())]
pub struct Rejection {
    pub kind: RejectionKind,
}

impl Rejection {
    pub fn new(kind: RejectionKind) -> Self {
        Self { kind }
    }

    pub fn reason_code(&self) -> &'static str {
        self.kind.reason_code()
    }

    /// HTTP status code equivalent of every rejection.
    pub fn http_status(&self) -> http::StatusCode {
        http::StatusCode::TOO_MANY_REQUESTS
    }
}

impl From<Rejection> for tonic::Status {
    fn from(rejection: Rejection) -> Self {
        let mut status = tonic::Status::resource_exhausted("too many requests");
        status.metadata_mut().insert(
            crate::transport::REASON_HEADER,
            tonic::metadata::MetadataValue::from_static(rejection.reason_code()),
        );
        status
    }
}
