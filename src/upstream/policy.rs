use super::host::UpstreamHost;
use super::pool::HostPool;
use rand::seq::SliceRandom;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// Per-request values a policy may need to make its decision.
pub struct SelectCtx<'a> {
    pub client_ip: IpAddr,
    pub uri: &'a str,
    /// Value of the header named by `policy_header` config, if any.
    pub header_value: Option<&'a str>,
}

/// One of the seven named selection policies. No trait objects: an enum of
/// small variants, matching the teacher's `LoadBalancer` shape.
pub enum Policy {
    Random,
    LeastConn,
    RoundRobin(Mutex<usize>),
    First,
    IpHash,
    UriHash,
    Header,
}

impl Policy {
    pub fn from_name(name: &str) -> Self {
        match name {
            "least_conn" => Policy::LeastConn,
            "round_robin" => Policy::RoundRobin(Mutex::new(0)),
            "first" => Policy::First,
            "ip_hash" => Policy::IpHash,
            "uri_hash" => Policy::UriHash,
            "header" => Policy::Header,
            _ => Policy::Random,
        }
    }

    /// Select an available host, or `None` if every host in the pool is
    /// unavailable.
    pub fn select(&self, pool: &HostPool, ctx: &SelectCtx<'_>) -> Option<Arc<UpstreamHost>> {
        match self {
            Policy::Random => select_random(pool),
            Policy::LeastConn => select_least_conn(pool),
            Policy::RoundRobin(counter) => select_round_robin(pool, counter),
            Policy::First => select_first(pool),
            Policy::IpHash => {
                let key = ctx.client_ip.to_string();
                select_hash_probe(pool, fnv1a32(key.as_bytes()))
            }
            Policy::UriHash => select_hash_probe(pool, fnv1a32(ctx.uri.as_bytes())),
            Policy::Header => match ctx.header_value.filter(|v| !v.is_empty()) {
                Some(v) => select_hash_probe(pool, fnv1a32(v.as_bytes())),
                // Falls back to round_robin when the named header is empty;
                // this policy owns no counter state of its own, so a fresh
                // one-shot counter suffices (policies are re-read per call).
                None => select_round_robin(pool, &Mutex::new(0)),
            },
        }
    }
}

fn available_hosts(pool: &HostPool) -> Vec<&Arc<UpstreamHost>> {
    pool.hosts().iter().filter(|h| h.available()).collect()
}

fn select_random(pool: &HostPool) -> Option<Arc<UpstreamHost>> {
    let avail = available_hosts(pool);
    avail.choose(&mut rand::thread_rng()).map(|h| (*h).clone())
}

/// Reads `conns` once per host during the scan, with no synchronization
/// between the min-tracking pass and the final pick. Under concurrent
/// mutation this can bias ties toward whichever host was scanned last —
/// preserved intentionally, not fixed (§9(a)).
fn select_least_conn(pool: &HostPool) -> Option<Arc<UpstreamHost>> {
    let avail = available_hosts(pool);
    if avail.is_empty() {
        return None;
    }
    let min = avail.iter().map(|h| h.conns()).min().unwrap();
    let tied: Vec<&&Arc<UpstreamHost>> = avail.iter().filter(|h| h.conns() == min).collect();
    tied.choose(&mut rand::thread_rng())
        .map(|h| (***h).clone())
}

fn select_round_robin(pool: &HostPool, counter: &Mutex<usize>) -> Option<Arc<UpstreamHost>> {
    let len = pool.len();
    if len == 0 {
        return None;
    }
    let mut start = counter.lock().unwrap();
    for step in 0..len {
        let idx = (*start + step) % len;
        let host = &pool.hosts()[idx];
        if host.available() {
            *start = (idx + 1) % len;
            return Some(host.clone());
        }
    }
    *start = (*start + 1) % len;
    None
}

fn select_first(pool: &HostPool) -> Option<Arc<UpstreamHost>> {
    pool.hosts().iter().find(|h| h.available()).cloned()
}

/// Probe at most `|pool|` positions starting at `hash % |pool|`, wrapping
/// around; always terminates.
fn select_hash_probe(pool: &HostPool, hash: u32) -> Option<Arc<UpstreamHost>> {
    let len = pool.len();
    if len == 0 {
        return None;
    }
    let start = (hash as usize) % len;
    for step in 0..len {
        let idx = (start + step) % len;
        let host = &pool.hosts()[idx];
        if host.available() {
            return Some(host.clone());
        }
    }
    None
}

/// FNV-1a, 32-bit.
fn fnv1a32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;
    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use std::time::Duration;

    fn host(name: &str) -> Arc<UpstreamHost> {
        Arc::new(UpstreamHost::new(
            name.to_string(),
            Address::Tcp {
                scheme: "http".to_string(),
                host: name.to_string(),
                port: 1,
            },
            None,
            0,
            1,
            Duration::from_secs(0),
        ))
    }

    fn ctx() -> SelectCtx<'static> {
        SelectCtx {
            client_ip: "127.0.0.1".parse().unwrap(),
            uri: "/foo",
            header_value: None,
        }
    }

    #[test]
    fn first_picks_first_available() {
        let a = host("a");
        let b = host("b");
        a.set_unhealthy(true);
        let pool = HostPool::new(vec![a, b.clone()]);
        let picked = Policy::First.select(&pool, &ctx()).unwrap();
        assert_eq!(picked.name, b.name);
    }

    #[test]
    fn round_robin_cycles() {
        let a = host("a");
        let b = host("b");
        let pool = HostPool::new(vec![a.clone(), b.clone()]);
        let policy = Policy::from_name("round_robin");
        let first = policy.select(&pool, &ctx()).unwrap();
        let second = policy.select(&pool, &ctx()).unwrap();
        assert_ne!(first.name, second.name);
    }

    #[test]
    fn round_robin_skips_unavailable_and_wraps_once() {
        let a = host("a");
        let b = host("b");
        a.set_unhealthy(true);
        let pool = HostPool::new(vec![a, b.clone()]);
        let policy = Policy::from_name("round_robin");
        for _ in 0..3 {
            let picked = policy.select(&pool, &ctx()).unwrap();
            assert_eq!(picked.name, b.name);
        }
    }

    #[test]
    fn least_conn_picks_min() {
        let a = host("a");
        let b = host("b");
        a.inc_conns();
        a.inc_conns();
        let pool = HostPool::new(vec![a, b.clone()]);
        let picked = Policy::LeastConn.select(&pool, &ctx()).unwrap();
        assert_eq!(picked.name, b.name);
    }

    #[test]
    fn hash_probe_terminates_when_all_unavailable() {
        let a = host("a");
        let b = host("b");
        a.set_unhealthy(true);
        b.set_unhealthy(true);
        let pool = HostPool::new(vec![a, b]);
        assert!(Policy::IpHash.select(&pool, &ctx()).is_none());
        assert!(Policy::UriHash.select(&pool, &ctx()).is_none());
    }

    #[test]
    fn header_policy_falls_back_when_empty() {
        let a = host("a");
        let pool = HostPool::new(vec![a.clone()]);
        let picked = Policy::Header.select(&pool, &ctx()).unwrap();
        assert_eq!(picked.name, a.name);
    }

    #[test]
    fn empty_pool_returns_none() {
        let pool = HostPool::new(vec![]);
        assert!(Policy::Random.select(&pool, &ctx()).is_none());
        assert!(Policy::from_name("round_robin").select(&pool, &ctx()).is_none());
    }
}
