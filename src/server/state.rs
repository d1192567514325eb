use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::routing::Proxy;
use crate::upstream::Upstream;
use std::sync::Arc;
use std::time::Instant;

/// Shared, cheaply-cloneable state handed to every connection/request task.
///
/// Unlike the teacher's hot-reloadable config behind an `ArcSwap`, upstreams
/// here are fixed for the process lifetime: a config change means a restart.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    pub proxy: Arc<Proxy>,
    pub metrics: Metrics,
    pub start: Instant,
}

impl ProxyState {
    pub fn new(config: ProxyConfig, metrics: Metrics) -> Result<Self, ProxyError> {
        let mut upstreams = Vec::with_capacity(config.upstreams.len());
        for cfg in &config.upstreams {
            upstreams.push(Upstream::new(cfg.clone())?);
        }
        Ok(Self {
            config: Arc::new(config),
            proxy: Arc::new(Proxy::new(upstreams)),
            metrics,
            start: Instant::now(),
        })
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
