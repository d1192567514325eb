use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context that flows through dispatch, rewriting, and logging.
pub struct RequestContext {
    pub host: String,
    pub uri_path: String,
    pub method: String,
    /// `from` prefix of the matched upstream, empty when no upstream matched.
    pub upstream_name: String,
    /// Dialed backend host name, set once an attempt has been made.
    pub upstream_addr: String,
    pub client_ip: IpAddr,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
    pub attempts: u32,
}

impl RequestContext {
    pub fn new(host: String, uri_path: String, method: String, client_ip: IpAddr) -> Self {
        Self {
            host,
            uri_path,
            method,
            upstream_name: String::new(),
            upstream_addr: String::new(),
            client_ip,
            start: Instant::now(),
            upstream_start: None,
            attempts: 0,
        }
    }

    /// Build a JSON error response and record metrics in one place — the
    /// single exit point for all error paths.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.record_metrics(status.as_u16());
        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }

    /// Record final metrics for a response that reached this point through
    /// the normal path (success or backend-propagated error status).
    pub fn finalize_metrics(&self, resp_status: u16) {
        self.record_metrics(resp_status);
    }

    fn record_metrics(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "relay_http_requests_total",
            "upstream" => self.upstream_name.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "relay_http_request_duration_seconds",
            "upstream" => self.upstream_name.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if !self.upstream_name.is_empty() {
            metrics::gauge!(
                "relay_http_requests_in_flight",
                "upstream" => self.upstream_name.clone(),
            )
            .decrement(1.0);
        }

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "relay_upstream_request_duration_seconds",
                "upstream" => self.upstream_name.clone(),
                "upstream_addr" => self.upstream_addr.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }
}
