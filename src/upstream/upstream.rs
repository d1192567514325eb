use super::health::{self, HealthCheckConfig, HealthCheckHandle};
use super::host::UpstreamHost;
use super::pool::HostPool;
use super::policy::{Policy, SelectCtx};
use crate::address::{self, Address};
use crate::config::{HeaderRule, UpstreamConfig};
use crate::error::ProxyError;
use crate::proxy::context::BoxBody;
use dashmap::DashMap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use hickory_resolver::TokioAsyncResolver;
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation — used for `insecure_skip_verify`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

mod unix {
    use hyper_util::client::legacy::connect::{Connected, Connection};
    use hyper_util::rt::TokioIo;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::net::UnixStream;

    #[derive(Clone)]
    pub struct UnixConnector {
        pub path: Arc<str>,
    }

    pub struct UnixIo(TokioIo<UnixStream>);

    impl hyper::rt::Read for UnixIo {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: hyper::rt::ReadBufCursor<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
        }
    }

    impl hyper::rt::Write for UnixIo {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
        }
        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_flush(cx)
        }
        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
        }
        fn is_write_vectored(&self) -> bool {
            self.0.is_write_vectored()
        }
    }

    impl Connection for UnixIo {
        fn connected(&self) -> Connected {
            Connected::new()
        }
    }

    impl tower_service::Service<http::Uri> for UnixConnector {
        type Response = UnixIo;
        type Error = std::io::Error;
        type Future =
            Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _uri: http::Uri) -> Self::Future {
            let path = self.path.clone();
            Box::pin(async move {
                let stream = UnixStream::connect(&*path).await?;
                Ok(UnixIo(TokioIo::new(stream)))
            })
        }
    }
}

pub struct RetryConfig {
    pub try_duration: Duration,
    pub try_interval: Duration,
}

/// One configured backend: its host pool, selection policy, retry/timeout
/// settings, header rules, and the pooled round-tripper used to reach it.
pub struct Upstream {
    config: UpstreamConfig,
    pool: Arc<HostPool>,
    policy: Policy,
    pub retry: RetryConfig,
    pub timeout: Duration,
    pub fallback_delay: Option<Duration>,
    pub without: Option<String>,
    except: GlobSet,
    tcp_client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    unix_clients: DashMap<String, Client<unix::UnixConnector, BoxBody>>,
    resolver: Option<TokioAsyncResolver>,
    health: AsyncMutex<Option<HealthCheckHandle>>,
    health_started: AtomicBool,
}

impl Upstream {
    pub fn new(config: UpstreamConfig) -> Result<Arc<Self>, ProxyError> {
        config.validate().map_err(ProxyError::Config)?;

        let fail_timeout = Duration::from_secs_f64(config.fail_timeout_secs);
        let mut hosts = Vec::new();
        for entry in &config.hosts {
            let (basic_auth, stripped) = address::split_userinfo(entry);
            for addr in address::expand(&stripped)? {
                let name = describe_address(&addr);
                hosts.push(Arc::new(UpstreamHost::new(
                    name,
                    addr,
                    basic_auth.clone(),
                    config.max_conns,
                    config.max_fails,
                    fail_timeout,
                )));
            }
        }
        if hosts.is_empty() {
            return Err(ProxyError::Config(format!(
                "upstream {:?} expanded to zero hosts",
                config.from
            )));
        }

        let resolver = if hosts.iter().any(|h| matches!(h.address, Address::Srv { .. })) {
            Some(
                TokioAsyncResolver::tokio_from_system_conf()
                    .map_err(|e| ProxyError::Config(format!("dns resolver init failed: {e}")))?,
            )
        } else {
            None
        };

        let except = build_except_globset(&config.except)?;
        let tcp_client = build_backend_client(&config)?;
        let policy = Policy::from_name(&config.policy);

        Ok(Arc::new(Self {
            pool: Arc::new(HostPool::new(hosts)),
            policy,
            retry: RetryConfig {
                try_duration: Duration::from_secs_f64(config.try_duration_secs),
                try_interval: Duration::from_millis(config.try_interval_ms),
            },
            timeout: Duration::from_secs_f64(config.timeout_secs),
            fallback_delay: config.fallback_delay_ms.map(Duration::from_millis),
            without: config.without.clone(),
            except,
            tcp_client,
            unix_clients: DashMap::new(),
            resolver,
            health: AsyncMutex::new(None),
            health_started: AtomicBool::new(false),
            config,
        }))
    }

    pub fn from_prefix(&self) -> &str {
        &self.config.from
    }

    pub fn policy_name(&self) -> &str {
        &self.config.policy
    }

    pub fn pool(&self) -> &Arc<HostPool> {
        &self.pool
    }

    pub fn policy_header(&self) -> Option<&str> {
        self.config.policy_header.as_deref()
    }

    pub fn transparent(&self) -> bool {
        self.config.transparent
    }

    pub fn websocket(&self) -> bool {
        self.config.websocket
    }

    pub fn header_upstream(&self) -> &[HeaderRule] {
        &self.config.header_upstream
    }

    pub fn header_downstream(&self) -> &[HeaderRule] {
        &self.config.header_downstream
    }

    /// `true` if `path` matches one of the upstream's `except` globs and
    /// should be excluded from matching this upstream at all (§6).
    pub fn is_excepted(&self, path: &str) -> bool {
        self.except.is_match(path)
    }

    pub fn select_host(&self, ctx: &SelectCtx<'_>) -> Option<Arc<UpstreamHost>> {
        self.policy.select(&self.pool, ctx)
    }

    /// Start the background health-check worker, if it hasn't already been
    /// started. Called from the first dispatched request rather than at
    /// boot (§3) — an upstream nobody sends traffic to never probes.
    pub async fn start_health_checks(self: &Arc<Self>) {
        if self.health_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.config.health_check_path.is_none() {
            return;
        }
        let handle = health::spawn(
            self.config.from.clone(),
            self.pool.clone(),
            HealthCheckConfig {
                path: self.config.health_check_path.clone(),
                interval: Duration::from_secs_f64(self.config.health_check_interval_secs),
                timeout: Duration::from_secs_f64(self.config.health_check_timeout_secs),
                port: self.config.health_check_port,
                contains: self.config.health_check_contains.clone(),
            },
            health::build_health_check_client(),
        );
        *self.health.lock().await = Some(handle);
    }

    pub async fn stop_health_checks(&self) {
        if let Some(handle) = self.health.lock().await.take() {
            handle.stop().await;
        }
    }

    /// Build the request URI actually sent to `host`: dial target
    /// resolution plus `without`-prefix trimming and query preservation
    /// (§4.6). SRV hosts are resolved fresh on every call.
    pub async fn target_uri(&self, host: &Arc<UpstreamHost>, original: &Uri) -> Result<Uri, ProxyError> {
        let (scheme, authority) = self.authority_for(host).await?;

        let mut path = original.path().to_string();
        if let Some(prefix) = &self.without {
            if let Some(stripped) = path.strip_prefix(prefix.as_str()) {
                path = stripped.to_string();
            }
        }
        if !path.starts_with('/') {
            path = format!("/{path}");
        }

        let mut path_and_query = path;
        if let Some(q) = original.query() {
            path_and_query.push('?');
            path_and_query.push_str(q);
        }

        Uri::builder()
            .scheme(scheme.as_str())
            .authority(authority.as_str())
            .path_and_query(path_and_query.as_str())
            .build()
            .map_err(|e| ProxyError::Internal(format!("building upstream uri: {e}")))
    }

    async fn authority_for(&self, host: &UpstreamHost) -> Result<(String, String), ProxyError> {
        match &host.address {
            Address::Tcp { scheme, host: h, port } => Ok((scheme.clone(), format!("{h}:{port}"))),
            Address::Unix { .. } => Ok(("http".to_string(), "unix-socket".to_string())),
            Address::Srv { scheme, name } => {
                let resolver = self.resolver.as_ref().ok_or_else(|| {
                    ProxyError::BackendRoundTrip("no resolver configured for srv host".to_string())
                })?;
                let lookup = resolver.srv_lookup(name.as_str()).await.map_err(|e| {
                    ProxyError::BackendRoundTrip(format!("srv lookup for {name} failed: {e}"))
                })?;
                let target = lookup.iter().next().ok_or_else(|| {
                    ProxyError::BackendRoundTrip(format!("srv lookup for {name} returned no records"))
                })?;
                let resolved_host = target.target().to_utf8();
                let resolved_host = resolved_host.trim_end_matches('.');
                Ok((scheme.clone(), format!("{resolved_host}:{}", target.port())))
            }
        }
    }

    pub async fn send(&self, host: &Arc<UpstreamHost>, req: Request<BoxBody>) -> Result<Response<Incoming>, ProxyError> {
        match &host.address {
            Address::Unix { path } => self
                .unix_client_for(path)
                .request(req)
                .await
                .map_err(|e| ProxyError::BackendRoundTrip(e.to_string())),
            _ => self
                .tcp_client
                .request(req)
                .await
                .map_err(|e| ProxyError::BackendRoundTrip(e.to_string())),
        }
    }

    fn unix_client_for(&self, path: &str) -> Client<unix::UnixConnector, BoxBody> {
        if let Some(existing) = self.unix_clients.get(path) {
            return existing.clone();
        }
        let connector = unix::UnixConnector { path: Arc::from(path) };
        let client = Client::builder(TokioExecutor::new()).build(connector);
        self.unix_clients.insert(path.to_string(), client.clone());
        client
    }
}

fn describe_address(addr: &Address) -> String {
    match addr {
        Address::Tcp { host, port, .. } => format!("{host}:{port}"),
        Address::Unix { path } => format!("unix:{path}"),
        Address::Srv { name, .. } => format!("srv:{name}"),
    }
}

fn build_except_globset(patterns: &[String]) -> Result<GlobSet, ProxyError> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        let glob = Glob::new(p)
            .map_err(|e| ProxyError::Config(format!("invalid except pattern {p:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| ProxyError::Config(format!("building except globset: {e}")))
}

/// Build the pooled HTTP(S) round-tripper for a TCP/SRV upstream. Mirrors
/// the teacher's cluster client builder, extended with CA bundles and
/// client-certificate (mTLS) support.
fn build_backend_client(cfg: &UpstreamConfig) -> Result<Client<HttpsConnector<HttpConnector>, BoxBody>, ProxyError> {
    let idle_timeout = Duration::from_secs_f64(cfg.timeout_secs.max(1.0));
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(idle_timeout));
    http.enforce_http(false);
    http.set_happy_eyeballs_timeout(cfg.fallback_delay_ms.map(Duration::from_millis));
    let keepalive = cfg.keepalive;

    let https = if cfg.insecure_skip_verify || !cfg.ca_certificates.is_empty() {
        let verifier_stage = if cfg.insecure_skip_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
        } else {
            rustls::ClientConfig::builder().with_root_certificates(load_root_store(&cfg.ca_certificates)?)
        };
        let tls_config = match &cfg.tls_client {
            Some(tc) => verifier_stage
                .with_client_auth_cert(load_certs(&tc.cert)?, load_key(&tc.key)?)
                .map_err(|e| ProxyError::Config(format!("client cert config: {e}")))?,
            None => verifier_stage.with_no_client_auth(),
        };
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    };

    let mut builder = Client::builder(TokioExecutor::new());
    if keepalive == 0 {
        // `keepalive = 0` disables connection reuse entirely (§6): no idle
        // connections are kept, so there's nothing for pool_idle_timeout to
        // time out.
        builder.pool_max_idle_per_host(0);
    } else {
        builder.pool_idle_timeout(idle_timeout).pool_max_idle_per_host(keepalive);
    }
    Ok(builder.build(https))
}

fn load_root_store(paths: &[String]) -> Result<rustls::RootCertStore, ProxyError> {
    let mut roots = rustls::RootCertStore::empty();
    for path in paths {
        let pem = std::fs::read(path)
            .map_err(|e| ProxyError::Config(format!("reading ca cert {path}: {e}")))?;
        let mut reader = std::io::BufReader::new(pem.as_slice());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| ProxyError::Config(format!("parsing ca cert {path}: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| ProxyError::Config(format!("adding ca cert {path}: {e}")))?;
        }
    }
    Ok(roots)
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ProxyError> {
    let pem = std::fs::read(path).map_err(|e| ProxyError::Config(format!("reading cert {path}: {e}")))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("parsing cert {path}: {e}")))
}

fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ProxyError> {
    let pem = std::fs::read(path).map_err(|e| ProxyError::Config(format!("reading key {path}: {e}")))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Config(format!("parsing key {path}: {e}")))?
        .ok_or_else(|| ProxyError::Config(format!("no private key found in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> UpstreamConfig {
        toml::from_str(
            r#"
            from = "/api"
            hosts = ["127.0.0.1:9000"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_upstream_config() {
        let mut cfg = minimal_config();
        cfg.hosts = vec![];
        assert!(Upstream::new(cfg).is_err());
    }

    #[test]
    fn describe_address_formats() {
        assert_eq!(
            describe_address(&Address::Tcp {
                scheme: "http".to_string(),
                host: "h".to_string(),
                port: 80
            }),
            "h:80"
        );
        assert_eq!(
            describe_address(&Address::Unix {
                path: "/tmp/x.sock".to_string()
            }),
            "unix:/tmp/x.sock"
        );
    }

    #[tokio::test]
    async fn target_uri_preserves_query_and_joins_path() {
        let upstream = Upstream::new(minimal_config()).unwrap();
        let host = upstream.pool().hosts()[0].clone();
        let original: Uri = "/api/widgets?limit=10".parse().unwrap();
        let built = upstream.target_uri(&host, &original).await.unwrap();
        assert_eq!(built.path(), "/api/widgets");
        assert_eq!(built.query(), Some("limit=10"));
        assert_eq!(built.authority().unwrap().as_str(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn target_uri_strips_without_prefix() {
        let mut cfg = minimal_config();
        cfg.without = Some("/api".to_string());
        let upstream = Upstream::new(cfg).unwrap();
        let host = upstream.pool().hosts()[0].clone();
        let original: Uri = "/api/widgets".parse().unwrap();
        let built = upstream.target_uri(&host, &original).await.unwrap();
        assert_eq!(built.path(), "/widgets");
    }

    #[test]
    fn except_globs_match() {
        let mut cfg = minimal_config();
        cfg.except = vec!["/api/internal/**".to_string()];
        let upstream = Upstream::new(cfg).unwrap();
        assert!(upstream.is_excepted("/api/internal/debug"));
        assert!(!upstream.is_excepted("/api/widgets"));
    }
}
