use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Treats a JSON/TOML `null` the same as a missing field, falling back to
/// the field's `Default` impl instead of erroring.
pub fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + DeserializeOwned,
    D: Deserializer<'de>,
{
    let opt = Option::<T>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_policy() -> String {
    "random".to_string()
}

fn default_max_fails() -> i32 {
    1
}

fn default_try_interval_ms() -> u64 {
    250
}

fn default_timeout_secs() -> f64 {
    30.0
}

fn default_health_interval_secs() -> f64 {
    30.0
}

fn default_health_timeout_secs() -> f64 {
    60.0
}

/// Root configuration: listener addresses and the ordered upstream list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstreams: Vec<UpstreamConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            upstreams: Vec::new(),
        }
    }
}

/// One `header_upstream` / `header_downstream` directive's verb.
///
/// Field-name prefixes on `field` are stripped at parse time: `+field` means
/// `Add`, `-field` means `Delete`, a bare name means `Set`. The
/// three-argument form (`field`, `pattern`, `replacement` all present) means
/// `ReplaceRegex`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HeaderVerb {
    Add,
    Set,
    Delete,
    ReplaceRegex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeaderRule {
    pub verb: HeaderVerb,
    pub field: String,
    #[serde(default)]
    pub value: String,
    /// Only set for `ReplaceRegex`.
    #[serde(default)]
    pub pattern: Option<String>,
}

impl HeaderRule {
    /// Parse a `header_upstream`/`header_downstream` directive's arguments
    /// (already split on whitespace, quotes removed) into a `HeaderRule`.
    pub fn parse(args: &[String]) -> Result<Self, String> {
        if args.is_empty() {
            return Err("header rule requires at least a field name".to_string());
        }
        let raw_field = &args[0];

        if args.len() >= 3 {
            return Ok(HeaderRule {
                verb: HeaderVerb::ReplaceRegex,
                field: raw_field.clone(),
                value: args[2].clone(),
                pattern: Some(args[1].clone()),
            });
        }

        if let Some(field) = raw_field.strip_prefix('+') {
            return Ok(HeaderRule {
                verb: HeaderVerb::Add,
                field: field.to_string(),
                value: args.get(1).cloned().unwrap_or_default(),
                pattern: None,
            });
        }
        if let Some(field) = raw_field.strip_prefix('-') {
            return Ok(HeaderRule {
                verb: HeaderVerb::Delete,
                field: field.to_string(),
                value: String::new(),
                pattern: None,
            });
        }

        let value = args
            .get(1)
            .cloned()
            .ok_or_else(|| format!("header_* rule for field {:?} requires a value", raw_field))?;
        Ok(HeaderRule {
            verb: HeaderVerb::Set,
            field: raw_field.clone(),
            value,
            pattern: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsClientConfig {
    pub cert: String,
    pub key: String,
}

/// One upstream's flat directive set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// URL-path prefix this upstream serves.
    pub from: String,

    /// Backend addresses, in the grammar understood by `crate::address`.
    pub hosts: Vec<String>,

    #[serde(default = "default_policy")]
    pub policy: String,
    /// Required only for `policy: header`.
    #[serde(default)]
    pub policy_header: Option<String>,

    #[serde(default)]
    pub fail_timeout_secs: f64,
    #[serde(default = "default_max_fails")]
    pub max_fails: i32,

    #[serde(default)]
    pub try_duration_secs: f64,
    #[serde(default = "default_try_interval_ms")]
    pub try_interval_ms: u64,

    #[serde(default)]
    pub max_conns: i64,
    #[serde(default)]
    pub keepalive: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub fallback_delay_ms: Option<u64>,

    #[serde(default)]
    pub health_check_path: Option<String>,
    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: f64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_check_timeout_secs: f64,
    #[serde(default)]
    pub health_check_port: Option<u16>,
    #[serde(default)]
    pub health_check_contains: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub header_upstream: Vec<HeaderRule>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub header_downstream: Vec<HeaderRule>,

    #[serde(default)]
    pub transparent: bool,
    #[serde(default)]
    pub websocket: bool,

    #[serde(default)]
    pub without: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub except: Vec<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub ca_certificates: Vec<String>,
    #[serde(default)]
    pub tls_client: Option<TlsClientConfig>,
}

fn is_srv_host(entry: &str) -> bool {
    let entry = entry.trim();
    entry.starts_with("srv://") || entry.starts_with("srv+https://")
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.from.is_empty() {
            return Err("upstream `from` must not be empty".to_string());
        }
        if self.hosts.is_empty() {
            return Err(format!("upstream {:?} has no hosts", self.from));
        }
        if self.max_fails < 1 {
            return Err(format!("upstream {:?}: max_fails must be >= 1", self.from));
        }
        if self.policy == "header" && self.policy_header.is_none() {
            return Err(format!(
                "upstream {:?}: policy `header` requires policy_header",
                self.from
            ));
        }
        if self.insecure_skip_verify && !self.ca_certificates.is_empty() {
            return Err(format!(
                "upstream {:?}: insecure_skip_verify and ca_certificates are mutually exclusive",
                self.from
            ));
        }
        if self.health_check_port.is_some() && self.hosts.iter().any(|h| is_srv_host(h)) {
            return Err(format!(
                "upstream {:?}: health_check_port cannot be combined with srv-backed hosts",
                self.from
            ));
        }
        Ok(())
    }
}
