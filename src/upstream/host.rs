use crate::address::Address;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::time::Duration;

/// One backend endpoint.
///
/// `conns`/`fails`/`unhealthy` are mutated concurrently by request tasks and
/// the health checker and are therefore plain atomics rather than fields
/// behind a lock — see the shared-resource policy for host counters.
pub struct UpstreamHost {
    pub name: String,
    pub address: Address,
    /// `user:pass` parsed from this host's configured userinfo, if any —
    /// injected as `Authorization: Basic` on requests that carry none (§4.1).
    pub basic_auth: Option<(String, String)>,
    conns: AtomicI64,
    max_conns: i64,
    fails: AtomicI32,
    max_fails: i32,
    unhealthy: AtomicBool,
    pub fail_timeout: Duration,
}

impl UpstreamHost {
    pub fn new(
        name: String,
        address: Address,
        basic_auth: Option<(String, String)>,
        max_conns: i64,
        max_fails: i32,
        fail_timeout: Duration,
    ) -> Self {
        Self {
            name,
            address,
            basic_auth,
            conns: AtomicI64::new(0),
            max_conns,
            fails: AtomicI32::new(0),
            max_fails,
            unhealthy: AtomicBool::new(false),
            fail_timeout,
        }
    }

    pub fn conns(&self) -> i64 {
        self.conns.load(Ordering::Relaxed)
    }

    pub fn fails(&self) -> i32 {
        self.fails.load(Ordering::Relaxed)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Relaxed)
    }

    pub fn set_unhealthy(&self, v: bool) {
        self.unhealthy.store(v, Ordering::Relaxed);
    }

    /// `maxFails = 0` means "no cap" for backward compatibility (§9(d)),
    /// even though the config-file parser rejects it when `< 1`.
    pub fn available(&self) -> bool {
        if self.unhealthy.load(Ordering::Relaxed) {
            return false;
        }
        if self.max_fails > 0 && self.fails.load(Ordering::Relaxed) >= self.max_fails {
            return false;
        }
        if self.max_conns > 0 && self.conns.load(Ordering::Relaxed) >= self.max_conns {
            return false;
        }
        true
    }

    pub fn inc_conns(&self) {
        self.conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conns(&self) {
        self.conns.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a failure; after `fail_timeout` elapses the counter decrements
    /// itself back down, matching nginx-style failure decay.
    pub fn record_failure(self: &std::sync::Arc<Self>) {
        self.fails.fetch_add(1, Ordering::Relaxed);
        if self.fail_timeout.is_zero() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.fail_timeout).await;
            this.fails.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn host(max_conns: i64, max_fails: i32) -> Arc<UpstreamHost> {
        Arc::new(UpstreamHost::new(
            "h".to_string(),
            Address::Tcp {
                scheme: "http".to_string(),
                host: "h".to_string(),
                port: 1,
            },
            None,
            max_conns,
            max_fails,
            Duration::from_secs(0),
        ))
    }

    #[test]
    fn available_by_default() {
        let h = host(0, 1);
        assert!(h.available());
    }

    #[test]
    fn unavailable_when_unhealthy() {
        let h = host(0, 1);
        h.set_unhealthy(true);
        assert!(!h.available());
    }

    #[test]
    fn unavailable_at_max_conns() {
        let h = host(1, 1);
        h.inc_conns();
        assert!(!h.available());
        h.dec_conns();
        assert!(h.available());
    }

    #[test]
    fn unavailable_at_max_fails() {
        let h = host(0, 1);
        h.record_failure();
        assert!(!h.available());
    }

    #[test]
    fn zero_max_conns_means_unlimited() {
        let h = host(0, 1);
        for _ in 0..1000 {
            h.inc_conns();
        }
        assert!(h.available());
    }
}
