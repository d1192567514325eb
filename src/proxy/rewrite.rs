use base64::Engine;
use crate::config::{HeaderRule, HeaderVerb};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::net::IpAddr;

/// Headers that are connection-scoped and must never be forwarded verbatim
/// in either direction (§4.4 step 1). `Proxy-*` is matched by prefix below
/// rather than listed here, since it's an open-ended family.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "alt-svc",
    "alternate-protocol",
];

fn is_proxy_header(name: &str) -> bool {
    name.len() > "proxy-".len() && name[.."proxy-".len()].eq_ignore_ascii_case("proxy-")
}

/// Remove every token the inbound `Connection` header itself names, in
/// addition to the fixed list — `Connection: x-foo` means `X-Foo` is also
/// hop-by-hop for this request, not just the usual suspects.
fn strip_connection_tokens(headers: &mut HeaderMap) {
    let tokens: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(',').map(|t| t.trim().to_string()))
        .filter(|t| !t.is_empty())
        .collect();
    for token in tokens {
        headers.remove(token.as_str());
    }
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    strip_connection_tokens(headers);
    let proxy_headers: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_proxy_header(name.as_str()))
        .cloned()
        .collect();
    for name in proxy_headers {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Like `strip_hop_by_hop`, but keeps `Connection`/`Upgrade` intact — used
/// on the `websocket` shorthand's upgrade path, where those two headers are
/// exactly what tells the backend to switch protocols (§6). The inbound
/// `Connection` value is left untouched too, since its own token list
/// (typically just `upgrade`) names headers that must also survive.
pub fn strip_hop_by_hop_keep_upgrade(headers: &mut HeaderMap) {
    let proxy_headers: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_proxy_header(name.as_str()))
        .cloned()
        .collect();
    for name in proxy_headers {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        if *name == "connection" || *name == "upgrade" {
            continue;
        }
        headers.remove(*name);
    }
}

/// Fold the client's address into `X-Forwarded-For`, appending to any
/// existing chain rather than overwriting it (§4.4).
pub fn fold_x_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    let ip = client_ip.to_string();
    match headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        Some(existing) => {
            let combined = format!("{existing}, {ip}");
            if let Ok(v) = HeaderValue::from_str(&combined) {
                headers.insert(XFF.clone(), v);
            }
        }
        None => {
            if let Ok(v) = HeaderValue::from_str(&ip) {
                headers.insert(XFF.clone(), v);
            }
        }
    }
}

pub fn set_x_forwarded_proto(headers: &mut HeaderMap, scheme: &str) {
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    if !headers.contains_key(&XFP) {
        if let Ok(v) = HeaderValue::from_str(scheme) {
            headers.insert(XFP.clone(), v);
        }
    }
}

pub fn set_x_forwarded_host(headers: &mut HeaderMap, original_host: &str) {
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }
}

/// `X-Real-IP`, part of the `transparent` shorthand's preset (§6) — unlike
/// `X-Forwarded-For` this is always a single address, never a chain.
pub fn set_x_real_ip(headers: &mut HeaderMap, client_ip: IpAddr) {
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");
    if let Ok(v) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert(XRI.clone(), v);
    }
}

/// Overwrite the outbound `Host` header with the resolved upstream
/// authority. Runs before `apply_header_rules` so an explicit `header_upstream
/// Host ...` rule still wins (§4.4 point 4).
pub fn set_host(headers: &mut HeaderMap, authority: &str) {
    if let Ok(v) = HeaderValue::from_str(authority) {
        headers.insert(http::header::HOST, v);
    }
}

/// Inject `Authorization: Basic ...` from a host's configured userinfo, only
/// when the request doesn't already carry an `Authorization` header (§4.1
/// step 3).
pub fn apply_basic_auth(headers: &mut HeaderMap, user: &str, pass: &str) {
    if headers.contains_key(http::header::AUTHORIZATION) {
        return;
    }
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
    if let Ok(v) = HeaderValue::from_str(&format!("Basic {encoded}")) {
        headers.insert(http::header::AUTHORIZATION, v);
    }
}

/// Values available for `{placeholder}` substitution inside a header
/// rule's value (§6).
pub struct Placeholders<'a> {
    pub upstream: &'a str,
}

fn expand_placeholders(value: &str, p: &Placeholders<'_>) -> String {
    value.replace("{upstream}", p.upstream)
}

/// Apply a `header_upstream` / `header_downstream` directive list in order.
pub fn apply_header_rules(rules: &[HeaderRule], headers: &mut HeaderMap, placeholders: &Placeholders<'_>) {
    for rule in rules {
        let Ok(name) = HeaderName::from_bytes(rule.field.as_bytes()) else {
            continue;
        };
        match rule.verb {
            HeaderVerb::Set => {
                let value = expand_placeholders(&rule.value, placeholders);
                if let Ok(v) = HeaderValue::from_str(&value) {
                    headers.insert(name, v);
                }
            }
            HeaderVerb::Add => {
                let value = expand_placeholders(&rule.value, placeholders);
                if let Ok(v) = HeaderValue::from_str(&value) {
                    headers.append(name, v);
                }
            }
            HeaderVerb::Delete => {
                headers.remove(&name);
            }
            HeaderVerb::ReplaceRegex => {
                let Some(pattern) = &rule.pattern else { continue };
                let Ok(re) = regex::Regex::new(pattern) else { continue };
                if let Some(current) = headers.get(&name).and_then(|v| v.to_str().ok()) {
                    let replaced = re.replace_all(current, rule.value.as_str()).into_owned();
                    if let Ok(v) = HeaderValue::from_str(&replaced) {
                        headers.insert(name, v);
                    }
                }
            }
        }
    }
}

/// Response headers that must pass through to the client unconditionally
/// (§4.4 response point 3), bypassing both hop-by-hop stripping and
/// `header_downstream` rules.
const PASSTHROUGH_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "content-disposition",
    "accept-ranges",
    "set-cookie",
    "cache-control",
    "expires",
];

/// Snapshot the mandated-passthrough headers before the rewrite pipeline
/// runs, so they can be restored verbatim afterward. `Set-Cookie` may be
/// repeated, so every value is captured, not just the first.
pub fn snapshot_passthrough_response_headers(headers: &HeaderMap) -> Vec<(&'static str, Vec<HeaderValue>)> {
    PASSTHROUGH_RESPONSE_HEADERS
        .iter()
        .filter_map(|name| {
            let values: Vec<HeaderValue> = headers.get_all(*name).iter().cloned().collect();
            (!values.is_empty()).then(|| (*name, values))
        })
        .collect()
}

/// Put back exactly what `snapshot_passthrough_response_headers` captured,
/// overwriting anything `header_downstream` rules did to the same names.
pub fn restore_passthrough_response_headers(headers: &mut HeaderMap, snapshot: Vec<(&'static str, Vec<HeaderValue>)>) {
    for (name, values) in snapshot {
        headers.remove(name);
        for value in values {
            headers.append(HeaderName::from_static(name), value);
        }
    }
}

// Trailers are never buffered or re-synthesized: the response body is
// passed through to the client as the same frame stream hyper produced for
// the backend response, so any trailer frame the backend sent rides along
// for free. There is deliberately no separate "copy trailers" step.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeaderVerb;

    #[test]
    fn strips_all_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-custom", HeaderValue::from_static("keep"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("upgrade"));
        assert!(headers.contains_key("x-custom"));
    }

    #[test]
    fn strips_trailer_alt_svc_and_proxy_wildcard() {
        let mut headers = HeaderMap::new();
        headers.insert("trailer", HeaderValue::from_static("x-checksum"));
        headers.insert("alt-svc", HeaderValue::from_static("h2=\":443\""));
        headers.insert("alternate-protocol", HeaderValue::from_static("443:npn-spdy/2"));
        headers.insert("proxy-foo", HeaderValue::from_static("bar"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("trailer"));
        assert!(!headers.contains_key("alt-svc"));
        assert!(!headers.contains_key("alternate-protocol"));
        assert!(!headers.contains_key("proxy-foo"));
    }

    #[test]
    fn strips_headers_named_by_connection_value() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("x-custom-token"));
        headers.insert("x-custom-token", HeaderValue::from_static("1"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("x-custom-token"));
    }

    #[test]
    fn xff_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        fold_x_forwarded_for(&mut headers, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.1, 10.0.0.2");
    }

    #[test]
    fn xff_sets_fresh_when_absent() {
        let mut headers = HeaderMap::new();
        fold_x_forwarded_for(&mut headers, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.2");
    }

    #[test]
    fn xfp_does_not_override_existing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        set_x_forwarded_proto(&mut headers, "http");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn header_rule_add_appends_without_removing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-foo", HeaderValue::from_static("a"));
        let rules = vec![HeaderRule {
            verb: HeaderVerb::Add,
            field: "x-foo".to_string(),
            value: "b".to_string(),
            pattern: None,
        }];
        apply_header_rules(&rules, &mut headers, &Placeholders { upstream: "api" });
        let values: Vec<_> = headers.get_all("x-foo").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn header_rule_set_replaces() {
        let mut headers = HeaderMap::new();
        headers.insert("x-foo", HeaderValue::from_static("a"));
        let rules = vec![HeaderRule {
            verb: HeaderVerb::Set,
            field: "x-foo".to_string(),
            value: "{upstream}".to_string(),
            pattern: None,
        }];
        apply_header_rules(&rules, &mut headers, &Placeholders { upstream: "api" });
        assert_eq!(headers.get("x-foo").unwrap(), "api");
    }

    #[test]
    fn header_rule_delete_removes() {
        let mut headers = HeaderMap::new();
        headers.insert("x-foo", HeaderValue::from_static("a"));
        let rules = vec![HeaderRule {
            verb: HeaderVerb::Delete,
            field: "x-foo".to_string(),
            value: String::new(),
            pattern: None,
        }];
        apply_header_rules(&rules, &mut headers, &Placeholders { upstream: "api" });
        assert!(!headers.contains_key("x-foo"));
    }

    #[test]
    fn passthrough_response_headers_survive_downstream_delete_rule() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let snapshot = snapshot_passthrough_response_headers(&headers);
        let rules = vec![
            HeaderRule {
                verb: HeaderVerb::Delete,
                field: "content-type".to_string(),
                value: String::new(),
                pattern: None,
            },
            HeaderRule {
                verb: HeaderVerb::Delete,
                field: "set-cookie".to_string(),
                value: String::new(),
                pattern: None,
            },
        ];
        apply_header_rules(&rules, &mut headers, &Placeholders { upstream: "api" });
        assert!(!headers.contains_key("content-type"));
        restore_passthrough_response_headers(&mut headers, snapshot);

        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn header_rule_replace_regex() {
        let mut headers = HeaderMap::new();
        headers.insert("x-foo", HeaderValue::from_static("secret-123"));
        let rules = vec![HeaderRule {
            verb: HeaderVerb::ReplaceRegex,
            field: "x-foo".to_string(),
            value: "[redacted]".to_string(),
            pattern: Some("secret-\\d+".to_string()),
        }];
        apply_header_rules(&rules, &mut headers, &Placeholders { upstream: "api" });
        assert_eq!(headers.get("x-foo").unwrap(), "[redacted]");
    }
}
