use crate::upstream::Upstream;
use std::sync::Arc;

/// Ordered set of configured upstreams, matched by longest `from` prefix.
///
/// There is no host partitioning and no per-route weighting here — an
/// inbound request is routed by path prefix alone, against whichever
/// upstream claims the longest matching prefix that doesn't also exclude
/// the path via `except` (§4.1, §6).
pub struct Proxy {
    upstreams: Vec<Arc<Upstream>>,
}

impl Proxy {
    pub fn new(upstreams: Vec<Arc<Upstream>>) -> Self {
        Self { upstreams }
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn match_upstream(&self, path: &str) -> Option<&Arc<Upstream>> {
        self.upstreams
            .iter()
            .filter(|u| path.starts_with(u.from_prefix()) && !u.is_excepted(path))
            .max_by_key(|u| u.from_prefix().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    fn upstream(from: &str, hosts: &str) -> Arc<Upstream> {
        let toml_str = format!("from = {from:?}\nhosts = [{hosts:?}]\n");
        let cfg: UpstreamConfig = toml::from_str(&toml_str).unwrap();
        Upstream::new(cfg).unwrap()
    }

    fn upstream_with_except(from: &str, hosts: &str, except: &str) -> Arc<Upstream> {
        let toml_str = format!(
            "from = {from:?}\nhosts = [{hosts:?}]\nexcept = [{except:?}]\n"
        );
        let cfg: UpstreamConfig = toml::from_str(&toml_str).unwrap();
        Upstream::new(cfg).unwrap()
    }

    #[test]
    fn matches_longest_prefix() {
        let proxy = Proxy::new(vec![
            upstream("/api", "127.0.0.1:1"),
            upstream("/api/v2", "127.0.0.1:2"),
        ]);
        let matched = proxy.match_upstream("/api/v2/widgets").unwrap();
        assert_eq!(matched.from_prefix(), "/api/v2");
    }

    #[test]
    fn falls_back_to_shorter_prefix() {
        let proxy = Proxy::new(vec![
            upstream("/api", "127.0.0.1:1"),
            upstream("/api/v2", "127.0.0.1:2"),
        ]);
        let matched = proxy.match_upstream("/api/v1/widgets").unwrap();
        assert_eq!(matched.from_prefix(), "/api");
    }

    #[test]
    fn no_match_returns_none() {
        let proxy = Proxy::new(vec![upstream("/api", "127.0.0.1:1")]);
        assert!(proxy.match_upstream("/other").is_none());
    }

    #[test]
    fn except_excludes_path_from_matching_upstream() {
        let proxy = Proxy::new(vec![
            upstream_with_except("/api", "127.0.0.1:1", "/api/internal/**"),
            upstream("/", "127.0.0.1:2"),
        ]);
        let matched = proxy.match_upstream("/api/internal/debug").unwrap();
        assert_eq!(matched.from_prefix(), "/");
    }
}
