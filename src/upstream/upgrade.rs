use crate::error::ProxyError;
use http::{HeaderMap, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::debug;

/// `true` when the request asks for a protocol upgrade: an `Upgrade` header
/// present together with a `Connection` header whose comma-separated token
/// list contains `upgrade` (case-insensitive) (§4.7).
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    is_upgrade_headers(req.headers())
}

/// Headers-only form of `is_upgrade_request`, for call sites holding
/// `Parts` rather than a full `Request`.
pub fn is_upgrade_headers(headers: &HeaderMap) -> bool {
    headers.get(http::header::UPGRADE).is_some() && connection_contains_upgrade(headers)
}

pub fn is_upgrade_response<B>(resp: &Response<B>) -> bool {
    resp.status() == StatusCode::SWITCHING_PROTOCOLS
}

fn connection_contains_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false)
}

/// Take the client-side upgrade handle before the request is consumed by
/// the rest of the dispatch path. `hyper::upgrade::on` extracts this from
/// the request's extensions without borrowing it afterward, so the
/// request can still be forwarded normally while this future is held for
/// later.
pub fn take_client_upgrade(req: &mut Request<Incoming>) -> OnUpgrade {
    hyper::upgrade::on(req)
}

/// Complete both sides of the handshake and splice the two connections
/// together until either side closes. `Upgraded` replays any bytes hyper
/// already buffered past the header boundary on its first read, so there
/// is no separate "pre-read bytes" step to implement.
pub async fn splice(client_upgrade: OnUpgrade, mut backend_resp: Response<Incoming>) -> Result<(), ProxyError> {
    let backend_upgrade = hyper::upgrade::on(&mut backend_resp);

    let (client_upgraded, backend_upgraded) = tokio::try_join!(client_upgrade, backend_upgrade)
        .map_err(|e| ProxyError::Internal(format!("upgrade handshake failed: {e}")))?;

    let mut client_io = TokioIo::new(client_upgraded);
    let mut backend_io = TokioIo::new(backend_upgraded);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((to_backend, to_client)) => {
            debug!(to_backend, to_client, "upgrade splice closed");
            Ok(())
        }
        Err(e) => Err(ProxyError::Internal(format!("splice failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_websocket_upgrade() {
        let req = Request::builder()
            .header("upgrade", "websocket")
            .header("connection", "keep-alive, Upgrade")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));
    }

    #[test]
    fn rejects_missing_connection_token() {
        let req = Request::builder()
            .header("upgrade", "websocket")
            .header("connection", "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn rejects_missing_upgrade_header() {
        let req = Request::builder()
            .header("connection", "upgrade")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn recognizes_switching_protocols() {
        let resp = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .body(())
            .unwrap();
        assert!(is_upgrade_response(&resp));
    }
}
