use super::body::BufferedBody;
use super::context::{empty_body, BoxBody, RequestContext};
use super::rewrite::{self, Placeholders};
use crate::error::ProxyError;
use crate::upstream::host::UpstreamHost;
use crate::upstream::policy::SelectCtx;
use crate::upstream::upstream::Upstream;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Request bodies buffered for retry are capped well below any sane upload
/// size; larger bodies simply forgo retry (only the first attempt streams).
const MAX_BUFFERED_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct Outcome {
    pub response: Response<Incoming>,
    pub upstream_elapsed: Duration,
}

/// Decrements `host.conns` when dropped, regardless of how the attempt
/// scope exits — early return, error, or the surrounding future being
/// dropped on cancellation.
struct ConnGuard<'a> {
    host: &'a Arc<UpstreamHost>,
}

impl Drop for ConnGuard<'_> {
    fn drop(&mut self) {
        self.host.dec_conns();
    }
}

/// Run the select/forward/retry loop against one matched upstream (§4.1).
pub async fn serve(
    upstream: &Arc<Upstream>,
    ctx: &mut RequestContext,
    req: Request<Incoming>,
    cancelled: &CancellationToken,
) -> Result<Outcome, Response<BoxBody>> {
    upstream.start_health_checks().await;

    let (parts, body) = req.into_parts();
    let uri_path = parts.uri.path().to_string();
    let is_upgrade = upstream.websocket() && crate::upstream::upgrade::is_upgrade_headers(&parts.headers);

    let should_buffer = upstream.pool().len() > 1 && !upstream.retry.try_duration.is_zero();
    let (buffered, mut streaming): (Option<BufferedBody>, Option<BoxBody>) = if should_buffer {
        match BufferedBody::buffer(body, MAX_BUFFERED_BODY_BYTES).await {
            Ok(b) => (Some(b), None),
            Err(ProxyError::MaxBytes) => {
                return Err(ctx.error_response(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"))
            }
            Err(e) => return Err(ctx.error_response(StatusCode::BAD_REQUEST, &e.to_string())),
        }
    } else {
        (None, Some(body.boxed()))
    };

    let start = Instant::now();
    let mut last_err: Option<ProxyError> = None;

    loop {
        if cancelled.is_cancelled() {
            return Err(ctx.error_response(ProxyError::Cancelled.status_code(), "request cancelled"));
        }

        let header_value = upstream
            .policy_header()
            .and_then(|name| parts.headers.get(name))
            .and_then(|v| v.to_str().ok());
        let select_ctx = SelectCtx {
            client_ip: ctx.client_ip,
            uri: &uri_path,
            header_value,
        };

        let host = match upstream.select_host(&select_ctx) {
            Some(h) => h,
            None => {
                last_err.get_or_insert(ProxyError::NoHosts);
                if retry_budget_exhausted(start, upstream.retry.try_duration) {
                    break;
                }
                if cancelled.is_cancelled() {
                    return Err(ctx.error_response(ProxyError::Cancelled.status_code(), "request cancelled"));
                }
                tokio::time::sleep(upstream.retry.try_interval).await;
                continue;
            }
        };

        ctx.upstream_addr = host.name.clone();

        let target_uri = match upstream.target_uri(&host, &parts.uri).await {
            Ok(u) => u,
            Err(e) => {
                last_err = Some(e);
                if retry_budget_exhausted(start, upstream.retry.try_duration) {
                    break;
                }
                tokio::time::sleep(upstream.retry.try_interval).await;
                continue;
            }
        };

        let mut headers = parts.headers.clone();
        if is_upgrade {
            rewrite::strip_hop_by_hop_keep_upgrade(&mut headers);
        } else {
            rewrite::strip_hop_by_hop(&mut headers);
        }
        rewrite::fold_x_forwarded_for(&mut headers, ctx.client_ip);
        rewrite::set_x_forwarded_proto(&mut headers, parts.uri.scheme_str().unwrap_or("http"));
        rewrite::set_x_forwarded_host(&mut headers, &ctx.host);
        if let Some(authority) = target_uri.authority() {
            rewrite::set_host(&mut headers, authority.as_str());
        }
        if upstream.transparent() {
            rewrite::set_x_real_ip(&mut headers, ctx.client_ip);
        }
        if let Some((user, pass)) = &host.basic_auth {
            rewrite::apply_basic_auth(&mut headers, user, pass);
        }
        rewrite::apply_header_rules(
            upstream.header_upstream(),
            &mut headers,
            &Placeholders { upstream: upstream.from_prefix() },
        );

        let attempt_body: BoxBody = match (&buffered, &mut streaming) {
            (Some(b), _) => b.rewind(),
            (None, slot) => slot.take().unwrap_or_else(empty_body),
        };

        let mut builder = Request::builder().method(parts.method.clone()).uri(target_uri);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let outgoing = match builder.body(attempt_body) {
            Ok(r) => r,
            Err(e) => {
                return Err(ctx.error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("building upstream request: {e}"),
                ))
            }
        };

        let outcome = {
            host.inc_conns();
            let _guard = ConnGuard { host: &host };

            let upstream_start = Instant::now();
            if ctx.upstream_start.is_none() {
                ctx.upstream_start = Some(upstream_start);
            }
            ctx.attempts += 1;

            let result = tokio::time::timeout(upstream.timeout, upstream.send(&host, outgoing)).await;
            (result, upstream_start)
        };

        match outcome {
            (Ok(Ok(resp)), upstream_start) => {
                return Ok(Outcome {
                    response: resp,
                    upstream_elapsed: upstream_start.elapsed(),
                });
            }
            (Ok(Err(ProxyError::MaxBytes)), _) => {
                return Err(ctx.error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "response exceeded maximum byte limit",
                ));
            }
            (Ok(Err(e)), _) => {
                warn!(upstream = upstream.from_prefix(), host = %host.name, error = %e, "backend round trip failed");
                host.record_failure();
                last_err = Some(e);
            }
            (Err(_elapsed), _) => {
                warn!(upstream = upstream.from_prefix(), host = %host.name, "backend round trip timed out");
                host.record_failure();
                last_err = Some(ProxyError::BackendRoundTrip("attempt timed out".to_string()));
            }
        }

        metrics::counter!(
            "relay_upstream_retries_total",
            "upstream" => upstream.from_prefix().to_string(),
        )
        .increment(1);

        if retry_budget_exhausted(start, upstream.retry.try_duration) {
            break;
        }
        if cancelled.is_cancelled() {
            return Err(ctx.error_response(ProxyError::Cancelled.status_code(), "request cancelled"));
        }
        tokio::time::sleep(upstream.retry.try_interval).await;
    }

    Err(last_error_response(ctx, last_err))
}

fn retry_budget_exhausted(start: Instant, try_duration: Duration) -> bool {
    start.elapsed() >= try_duration
}

fn last_error_response(ctx: &RequestContext, err: Option<ProxyError>) -> Response<BoxBody> {
    let err = err.unwrap_or(ProxyError::NoHosts);
    ctx.error_response(StatusCode::BAD_GATEWAY, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_exhausted_is_immediate_when_zero() {
        let start = Instant::now();
        assert!(retry_budget_exhausted(start, Duration::ZERO));
    }

    #[test]
    fn retry_budget_not_exhausted_within_window() {
        let start = Instant::now();
        assert!(!retry_budget_exhausted(start, Duration::from_secs(60)));
    }
}
