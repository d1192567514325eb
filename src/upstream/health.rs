use super::host::UpstreamHost;
use super::pool::HostPool;
use crate::address::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Per-upstream active health check settings, carried over from
/// `UpstreamConfig` without its serde plumbing.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub path: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub port: Option<u16>,
    pub contains: Option<String>,
}

/// Handle to a running background prober. Dropping it does not stop the
/// task; call `stop` and await it during shutdown so the caller can be sure
/// no probe is still in flight.
pub struct HealthCheckHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HealthCheckHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}

/// Spawn the dedicated health-check worker for one upstream. Each upstream
/// owns exactly one such task for its lifetime; there is no shared
/// cross-upstream scheduler.
pub fn spawn(
    name: String,
    pool: Arc<HostPool>,
    config: HealthCheckConfig,
    client: reqwest::Client,
) -> HealthCheckHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        if config.path.is_none() {
            return;
        }
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    probe_all(&name, &pool, &config, &client).await;
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    HealthCheckHandle { stop_tx, join }
}

async fn probe_all(name: &str, pool: &HostPool, config: &HealthCheckConfig, client: &reqwest::Client) {
    for host in pool.hosts() {
        probe_one(name, host, config, client).await;
    }
}

async fn probe_one(name: &str, host: &Arc<UpstreamHost>, config: &HealthCheckConfig, client: &reqwest::Client) {
    let path = config.path.as_deref().unwrap_or("/");
    let url = match probe_url(host, config.port, path).await {
        Some(url) => url,
        None => return,
    };

    let result = client.get(&url).timeout(config.timeout).send().await;
    metrics::counter!("relay_health_check_total", "upstream" => name.to_string()).increment(1);
    let healthy = match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if !(200..400).contains(&status) {
                false
            } else if let Some(needle) = &config.contains {
                resp.text()
                    .await
                    .map(|body| body.contains(needle.as_str()))
                    .unwrap_or(false)
            } else {
                true
            }
        }
        Err(_) => false,
    };

    if healthy {
        if host.is_unhealthy() {
            debug!(upstream = name, host = host.name, "health check recovered, marking healthy");
        }
        host.set_unhealthy(false);
    } else {
        if !host.is_unhealthy() {
            warn!(upstream = name, host = host.name, url, "health check failed, marking unhealthy");
        }
        host.set_unhealthy(true);
    }
    metrics::gauge!(
        "relay_upstream_health_status",
        "upstream" => name.to_string(),
        "host" => host.name.clone(),
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Build the URL to probe. UNIX-socket hosts have no HTTP-reachable health
/// endpoint in this implementation and are skipped (never marked unhealthy
/// by the prober — only by request-path failures).
async fn probe_url(host: &Arc<UpstreamHost>, override_port: Option<u16>, path: &str) -> Option<String> {
    match &host.address {
        Address::Tcp { scheme, host: h, port } => {
            let port = override_port.unwrap_or(*port);
            Some(format!("{scheme}://{h}:{port}{path}"))
        }
        Address::Unix { .. } => None,
        Address::Srv { scheme, name } => {
            // Port overrides are forbidden for SRV-backed hosts (§4.5) — the
            // SRV record itself is authoritative on port, and config
            // validation already rejects this combination, so this is
            // belt-and-suspenders against direct construction bypassing it.
            let resolver =
                hickory_resolver::TokioAsyncResolver::tokio_from_system_conf().ok()?;
            let lookup = resolver.srv_lookup(name.as_str()).await.ok()?;
            let target = lookup.iter().next()?;
            let resolved_host = target.target().to_utf8();
            let port = target.port();
            Some(format!("{scheme}://{resolved_host}:{port}{path}"))
        }
    }
}

/// Build the shared client used for active health checks. Separate from the
/// backend round-tripper so a slow/hostile backend can't starve health
/// checks of connections from the proxying pool.
pub fn build_health_check_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .no_proxy()
        .build()
        .expect("failed to build health check client")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: Address) -> Arc<UpstreamHost> {
        Arc::new(UpstreamHost::new("h".to_string(), addr, None, 0, 1, Duration::from_secs(0)))
    }

    #[tokio::test]
    async fn probe_url_skips_unix_sockets() {
        let h = host(Address::Unix {
            path: "/tmp/x.sock".to_string(),
        });
        assert!(probe_url(&h, None, "/health").await.is_none());
    }

    #[tokio::test]
    async fn probe_url_builds_tcp_url() {
        let h = host(Address::Tcp {
            scheme: "http".to_string(),
            host: "example.internal".to_string(),
            port: 8080,
        });
        let url = probe_url(&h, None, "/health").await.unwrap();
        assert_eq!(url, "http://example.internal:8080/health");
    }

    #[tokio::test]
    async fn probe_url_honors_port_override() {
        let h = host(Address::Tcp {
            scheme: "http".to_string(),
            host: "example.internal".to_string(),
            port: 8080,
        });
        let url = probe_url(&h, Some(9000), "/health").await.unwrap();
        assert_eq!(url, "http://example.internal:9000/health");
    }

    #[tokio::test]
    async fn stop_joins_cleanly_when_no_path_configured() {
        let pool = Arc::new(HostPool::new(vec![]));
        let config = HealthCheckConfig {
            path: None,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(1),
            port: None,
            contains: None,
        };
        let handle = spawn("t".to_string(), pool, config, build_health_check_client());
        handle.stop().await;
    }
}
