use std::fmt;

/// Error kinds surfaced by the dispatch / rewrite / round-trip pipeline.
///
/// `BackendRoundTrip` is recovered locally by the retry loop; every other
/// kind surfaces immediately to the caller. Health-check failures never
/// produce a `ProxyError` — they only flip a host's `unhealthy` flag.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ProxyError {
    NoMatch,
    BodyBuffer(String),
    NoHosts,
    BackendRoundTrip(String),
    MaxBytes,
    Cancelled,
    NonHijacker,
    RewindFailure(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoMatch => write!(f, "no upstream matched the request"),
            ProxyError::BodyBuffer(msg) => write!(f, "unable to buffer request body: {}", msg),
            ProxyError::NoHosts => write!(f, "no hosts available upstream"),
            ProxyError::BackendRoundTrip(msg) => write!(f, "backend round-trip failed: {}", msg),
            ProxyError::MaxBytes => write!(f, "response exceeded maximum byte limit"),
            ProxyError::Cancelled => write!(f, "request cancelled"),
            ProxyError::NonHijacker => write!(f, "response writer does not support hijacking"),
            ProxyError::RewindFailure(msg) => write!(f, "unable to rewind buffered body: {}", msg),
            ProxyError::Config(msg) => write!(f, "config error: {}", msg),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    /// Status this error maps to when converted directly into a synthesized
    /// response. The cancellation status (499) is a private sentinel
    /// distinct from 502 so it can be distinguished from ordinary backend
    /// failure by callers that care (§4.1).
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            ProxyError::NoMatch => StatusCode::NOT_FOUND,
            ProxyError::BodyBuffer(_) => StatusCode::BAD_REQUEST,
            ProxyError::NoHosts | ProxyError::BackendRoundTrip(_) => StatusCode::BAD_GATEWAY,
            ProxyError::MaxBytes => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Cancelled => StatusCode::from_u16(499).unwrap(),
            ProxyError::NonHijacker
            | ProxyError::RewindFailure(_)
            | ProxyError::Internal(_)
            | ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
