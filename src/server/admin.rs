use super::state::ProxyState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: ProxyState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let upstream_count = state.proxy.upstreams().len();
            let unhealthy: usize = state
                .proxy
                .upstreams()
                .iter()
                .flat_map(|u| u.pool().hosts().iter())
                .filter(|h| h.is_unhealthy())
                .count();
            Ok(Response::builder()
                .status(200)
                .body(full_body(format!(
                    r#"{{"status":"ready","upstreams":{},"unhealthy_hosts":{},"uptime_secs":{}}}"#,
                    upstream_count,
                    unhealthy,
                    state.uptime().as_secs(),
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/upstreams" => {
            let upstreams: Vec<serde_json::Value> = state
                .proxy
                .upstreams()
                .iter()
                .map(|u| {
                    let hosts: Vec<serde_json::Value> = u
                        .pool()
                        .hosts()
                        .iter()
                        .map(|h| {
                            serde_json::json!({
                                "name": h.name,
                                "available": h.available(),
                                "conns": h.conns(),
                                "fails": h.fails(),
                                "unhealthy": h.is_unhealthy(),
                            })
                        })
                        .collect();
                    serde_json::json!({
                        "from": u.from_prefix(),
                        "policy": u.policy_name(),
                        "websocket": u.websocket(),
                        "hosts": hosts,
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&upstreams).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
