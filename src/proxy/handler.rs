use crate::proxy::context::{empty_body, BoxBody, RequestContext};
use crate::proxy::dispatch;
use crate::proxy::rewrite::{self, Placeholders};
use crate::server::state::ProxyState;
use crate::upstream::upgrade;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle one inbound request end to end: match an upstream by path prefix,
/// dispatch it through the retry loop, then either splice an upgraded
/// connection or rewrite and stream back the backend's response.
pub async fn handle_request(
    mut req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let uri_path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    // The client's own address is always the TCP peer, never taken from an
    // inbound X-Forwarded-For — that header is attacker-controlled input,
    // not a trust boundary this proxy sits behind.
    let client_ip = peer_addr.ip();

    let mut ctx = RequestContext::new(host, uri_path.clone(), method, client_ip);

    let upstream = match state.proxy.match_upstream(&uri_path) {
        Some(u) => u.clone(),
        None => {
            debug!(host = %ctx.host, uri = %ctx.uri_path, "no upstream matched");
            return Ok(ctx.error_response(StatusCode::NOT_FOUND, "not found"));
        }
    };
    ctx.upstream_name = upstream.from_prefix().to_string();

    metrics::gauge!(
        "relay_http_requests_in_flight",
        "upstream" => ctx.upstream_name.clone(),
    )
    .increment(1.0);

    let wants_upgrade = upstream.websocket() && upgrade::is_upgrade_request(&req);
    let client_upgrade = wants_upgrade.then(|| upgrade::take_client_upgrade(&mut req));

    // No connection-close signal is wired in from the server's accept loop
    // yet, so this token is only ever cancelled by graceful shutdown; it is
    // threaded through the full retry loop so that plumbing is in one place.
    let cancelled = CancellationToken::new();

    let (backend_resp, upstream_elapsed) = match dispatch::serve(&upstream, &mut ctx, req, &cancelled).await {
        Ok(outcome) => (outcome.response, outcome.upstream_elapsed),
        Err(resp) => return Ok(resp),
    };

    if wants_upgrade && upgrade::is_upgrade_response(&backend_resp) {
        if let Some(client_upgrade) = client_upgrade {
            return Ok(finish_upgrade(&mut ctx, client_upgrade, backend_resp));
        }
    }

    let status = backend_resp.status();
    let (mut parts, body) = backend_resp.into_parts();

    let passthrough = rewrite::snapshot_passthrough_response_headers(&parts.headers);
    rewrite::strip_hop_by_hop(&mut parts.headers);
    rewrite::apply_header_rules(
        upstream.header_downstream(),
        &mut parts.headers,
        &Placeholders { upstream: upstream.from_prefix() },
    );
    rewrite::restore_passthrough_response_headers(&mut parts.headers, passthrough);

    if let Some(len) = parts
        .headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
    {
        metrics::histogram!(
            "relay_http_response_size_bytes",
            "upstream" => ctx.upstream_name.clone(),
        )
        .record(len);
    }

    let mut response = Response::from_parts(parts, body.boxed());
    *response.status_mut() = status;

    ctx.finalize_metrics(status.as_u16());
    debug!(
        upstream = %ctx.upstream_name,
        upstream_addr = %ctx.upstream_addr,
        status = status.as_u16(),
        elapsed_ms = upstream_elapsed.as_millis() as u64,
        attempts = ctx.attempts,
        "proxied request"
    );

    Ok(response)
}

/// Acknowledge the 101 to the client and hand the real tunnel off to a
/// background task; the handler's own response carries no body.
fn finish_upgrade(
    ctx: &mut RequestContext,
    client_upgrade: hyper::upgrade::OnUpgrade,
    backend_resp: Response<Incoming>,
) -> Response<BoxBody> {
    let status = backend_resp.status();
    let headers = backend_resp.headers().clone();

    tokio::spawn(async move {
        if let Err(e) = upgrade::splice(client_upgrade, backend_resp).await {
            warn!(error = %e, "upgrade splice ended with error");
        }
    });

    ctx.finalize_metrics(status.as_u16());

    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(empty_body()).unwrap_or_else(|_| ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "upgrade response build failed"))
}
