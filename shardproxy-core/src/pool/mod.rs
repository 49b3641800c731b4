//! Server pool: shard lifecycle, consistent-hash continuum, ejection on
//! failure, quota gate (§4.E, §4.F, §4.J).

pub mod backend;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::hash::ketama::{Continuum, WeightedMember};
use crate::hash::{hash_tag_extract, Distribution, HashFn};
use crate::protocol::Wire;
use crate::quota::QuotaGate;

pub use backend::{BackendServer, BackendStatus};

#[derive(Debug, Clone)]
pub struct PoolRuntimeConfig {
    pub name: String,
    pub listen: SocketAddr,
    pub hash_fn: HashFn,
    pub hash_tag: Option<(u8, u8)>,
    pub distribution: Distribution,
    pub timeout: Duration,
    pub backlog: u32,
    pub client_connections: usize,
    pub server_connections: usize,
    pub server_retry_timeout: Duration,
    pub server_failure_limit: u32,
    pub auto_eject_hosts: bool,
    pub flow_control: bool,
    pub quota: u64,
    pub password: Option<String>,
    pub client_auth: Option<String>,
    pub preconnect: bool,
    pub wire: Wire,
}

pub struct ServerPool {
    pub config: PoolRuntimeConfig,
    pub backends: Vec<BackendServer>,
    pub continuum: Continuum,
    pub quota_gate: QuotaGate,
    /// Maps a continuum-local backend index (0..live.len()) back to its real
    /// index in `self.backends`, since the continuum itself only ever sees
    /// the live subset.
    live_index_map: Vec<usize>,
    /// Set when a failure event has just ejected/re-admitted a backend;
    /// cleared by `rebuild_continuum`. Models `next_rebuild` from §4.E
    /// without a real timer — the continuum is rebuilt eagerly on every
    /// membership change instead of batched, which is simpler and correct
    /// since rebuilds are cheap relative to request handling.
    dirty: bool,
}

impl ServerPool {
    pub fn new(config: PoolRuntimeConfig, backends: Vec<BackendServer>) -> ServerPool {
        let quota_gate = QuotaGate::new(config.quota, config.flow_control);
        let mut pool = ServerPool {
            config,
            backends,
            continuum: Continuum::default(),
            quota_gate,
            live_index_map: Vec::new(),
            dirty: true,
        };
        pool.rebuild_continuum();
        pool
    }

    pub fn live_backend_count(&self) -> usize {
        self.backends.iter().filter(|b| !b.is_ejected()).count()
    }

    fn live_members(&self) -> Vec<(usize, WeightedMember)> {
        self.backends
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_ejected())
            .map(|(idx, b)| {
                (
                    idx,
                    WeightedMember {
                        label: format!("{}:{}", b.addr.ip(), b.addr.port()),
                        weight: b.weight,
                    },
                )
            })
            .collect()
    }

    pub fn rebuild_continuum(&mut self) {
        let live = self.live_members();
        // `Continuum::build` only knows backend indices 0..live.len(); the
        // mapping back to real backend indices in `self.backends` is kept
        // alongside so lookups can translate.
        let members: Vec<WeightedMember> = live.iter().map(|(_, m)| m.clone()).collect();
        let built = Continuum::build(&members, self.config.distribution, self.config.hash_fn);
        self.live_index_map = live.into_iter().map(|(idx, _)| idx).collect();
        self.continuum = built;
        self.dirty = false;
    }

    /// Routes `key` to a live backend index, honoring the configured
    /// hash-tag extraction (§4.E) and distribution policy.
    pub fn route(&self, key: &[u8]) -> Option<usize> {
        let tagged = hash_tag_extract(key, self.config.hash_tag);
        let hash = self.config.hash_fn.hash(tagged);
        match self.config.distribution {
            Distribution::Ketama => self
                .continuum
                .lookup(hash)
                .and_then(|local| self.live_index_map.get(local).copied()),
            Distribution::Modula => {
                let live = self.live_index_map.len();
                self.continuum
                    .lookup_modula(hash, live)
                    .and_then(|local| self.live_index_map.get(local).copied())
            }
            Distribution::Random => {
                let live = self.live_index_map.len();
                if live == 0 {
                    None
                } else {
                    let local = (hash as usize).wrapping_mul(2654435761) % live;
                    self.live_index_map.get(local).copied()
                }
            }
        }
    }

    pub fn record_failure(&mut self, backend_index: usize, now: Instant) {
        let Some(backend) = self.backends.get_mut(backend_index) else {
            return;
        };
        backend.record_failure();
        if self.config.auto_eject_hosts && backend.failure_count >= self.config.server_failure_limit {
            backend.eject(now + self.config.server_retry_timeout);
            self.dirty = true;
            self.rebuild_continuum();
        }
    }

    pub fn record_success(&mut self, backend_index: usize) {
        if let Some(backend) = self.backends.get_mut(backend_index) {
            backend.record_success();
        }
    }

    /// Re-admits any ejected backend whose retry deadline has passed,
    /// rebuilding the continuum if membership changed (§4.E).
    pub fn retry_ejected(&mut self, now: Instant) {
        let mut changed = false;
        for backend in &mut self.backends {
            if backend.ready_for_retry(now) {
                backend.readmit();
                changed = true;
            }
        }
        if changed {
            self.rebuild_continuum();
        }
    }

    pub fn find_backend_by_name(&self, name: &str) -> Option<usize> {
        self.backends.iter().position(|b| b.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config() -> PoolRuntimeConfig {
        PoolRuntimeConfig {
            name: "pool1".into(),
            listen: "127.0.0.1:0".parse().unwrap(),
            hash_fn: HashFn::Md5,
            hash_tag: None,
            distribution: Distribution::Ketama,
            timeout: Duration::from_millis(50),
            backlog: 128,
            client_connections: 1024,
            server_connections: 1,
            server_retry_timeout: Duration::from_secs(30),
            server_failure_limit: 2,
            auto_eject_hosts: true,
            flow_control: false,
            quota: 0,
            password: None,
            client_auth: None,
            preconnect: false,
            wire: Wire::Resp,
        }
    }

    fn addr(last_octet: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port)
    }

    fn two_backends() -> Vec<BackendServer> {
        vec![
            BackendServer::new("a".into(), addr(1, 6379), 1, vec![]),
            BackendServer::new("b".into(), addr(2, 6379), 1, vec![]),
        ]
    }

    #[test]
    fn route_is_deterministic_for_same_key() {
        let pool = ServerPool::new(test_config(), two_backends());
        let a = pool.route(b"key_1");
        let b = pool.route(b"key_1");
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn ejects_backend_after_failure_limit_and_routes_around_it() {
        let mut pool = ServerPool::new(test_config(), two_backends());
        let now = Instant::now();
        pool.record_failure(0, now);
        assert!(pool.backends[0].status == BackendStatus::Online);
        pool.record_failure(0, now);
        assert_eq!(pool.backends[0].status, BackendStatus::KickedOut);
        assert_eq!(pool.live_backend_count(), 1);
        // every key must now route to backend 1, the only live one.
        for i in 0..50 {
            let key = format!("key_{i}");
            assert_eq!(pool.route(key.as_bytes()), Some(1));
        }
    }

    #[test]
    fn retry_readmits_after_deadline() {
        let mut pool = ServerPool::new(test_config(), two_backends());
        let now = Instant::now();
        pool.record_failure(0, now);
        pool.record_failure(0, now);
        assert_eq!(pool.live_backend_count(), 1);
        pool.retry_ejected(now + Duration::from_secs(31));
        assert_eq!(pool.live_backend_count(), 2);
        assert_eq!(pool.backends[0].status, BackendStatus::Online);
    }
}
