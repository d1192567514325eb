pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl ProxyConfig {
    /// Load configuration from a file (if it exists), apply environment
    /// overrides, then validate. When the file does not exist, built-in
    /// defaults are used so the proxy can start with zero configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ProxyConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            ProxyConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded proxy configuration, upstreams={}", config.upstreams.len());
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PROXY_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("PROXY_ADMIN_LISTEN") {
            self.admin_listen = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            anyhow::bail!("listen address cannot be empty");
        }
        for upstream in &self.upstreams {
            upstream
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid upstream config: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = ProxyConfig::load(Path::new("/nonexistent/relay-proxy.toml")).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:8080");
    }

    #[test]
    fn load_parses_toml() {
        let mut file = tempfile_toml(
            r#"
            listen = "127.0.0.1:9000"

            [[upstreams]]
            from = "/api"
            hosts = ["127.0.0.1:9100"]
            "#,
        );
        let cfg = ProxyConfig::load(file.path()).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.upstreams.len(), 1);
        assert_eq!(cfg.upstreams[0].from, "/api");
        file.flush().unwrap();
    }

    #[test]
    fn validate_rejects_invalid_upstream() {
        let cfg = ProxyConfig {
            upstreams: vec![types::UpstreamConfig {
                from: "/api".to_string(),
                hosts: vec![],
                ..default_upstream()
            }],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    fn default_upstream() -> types::UpstreamConfig {
        toml::from_str(r#"from = "/x"
hosts = ["127.0.0.1:1"]"#)
            .unwrap()
    }

    fn tempfile_toml(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    struct NamedTempFile(std::path::PathBuf, std::fs::File);

    impl NamedTempFile {
        fn with_suffix(suffix: &str) -> std::io::Result<Self> {
            let path = std::env::temp_dir().join(format!(
                "relay-proxy-test-{}{}",
                std::process::id(),
                suffix
            ));
            let file = std::fs::File::create(&path)?;
            Ok(Self(path, file))
        }

        fn path(&self) -> &std::path::Path {
            &self.0
        }
    }

    impl Write for NamedTempFile {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.1.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.1.flush()
        }
    }

    impl Drop for NamedTempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }
}
