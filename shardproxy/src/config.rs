//! Thin wrapper over `shardproxy_core::config`: loads the YAML document and
//! converts its `PoolConfig`s into the runtime `ServerPool`s the event loop
//! actually drives (§10.1).

use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use shardproxy_core::config::{PoolConfig, ProxyConfig};
use shardproxy_core::error::ConfigError;
use shardproxy_core::pool::backend::BackendServer;
use shardproxy_core::pool::{PoolRuntimeConfig, ServerPool};

/// Loads and validates the configuration file at `path` (§10.1).
pub fn load(path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
    ProxyConfig::load_file(path)
}

/// Builds every configured pool into a runtime `ServerPool`, resolving each
/// pool's backend lines along the way. Called once at startup; `main`
/// bubbles any error with `anyhow::Context` and exits 1 (§7).
pub fn build_pools(config: &ProxyConfig) -> Result<Vec<ServerPool>, ConfigError> {
    config
        .pools
        .keys()
        .map(|name| build_pool(config, name))
        .collect()
}

fn build_pool(config: &ProxyConfig, name: &str) -> Result<ServerPool, ConfigError> {
    let pool_cfg: &PoolConfig = &config.pools[name];
    let listen: SocketAddr = pool_cfg
        .listen
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            pool: name.to_string(),
            field: "listen",
            value: pool_cfg.listen.clone(),
        })?;

    let backend_lines = config.resolve_backends(name)?;
    let backends = backend_lines
        .into_iter()
        .map(|line| {
            let addr = SocketAddr::new(
                line.host
                    .parse::<IpAddr>()
                    .unwrap_or_else(|_| resolve_host_or_loopback(&line.host)),
                line.port,
            );
            BackendServer::new(line.name, addr, line.weight, line.slaves)
        })
        .collect();

    let runtime = PoolRuntimeConfig {
        name: name.to_string(),
        listen,
        hash_fn: pool_cfg.hash.unwrap_or(shardproxy_core::hash::HashFn::Fnv1a64),
        hash_tag: pool_cfg.hash_tag_bytes(),
        distribution: pool_cfg.distribution.unwrap_or(shardproxy_core::hash::Distribution::Ketama),
        timeout: pool_cfg.timeout_duration(),
        backlog: pool_cfg.backlog,
        client_connections: pool_cfg.client_connections,
        server_connections: pool_cfg.server_connections,
        server_retry_timeout: pool_cfg.server_retry_timeout_duration(),
        server_failure_limit: pool_cfg.server_failure_limit,
        auto_eject_hosts: pool_cfg.auto_eject_hosts,
        flow_control: pool_cfg.flow_control,
        quota: pool_cfg.quota,
        password: pool_cfg.password.clone(),
        client_auth: pool_cfg.client_auth.clone(),
        preconnect: pool_cfg.preconnect,
        wire: pool_cfg.wire(),
    };

    Ok(ServerPool::new(runtime, backends))
}

/// Backend hostnames are expected to already be literal IPs in production
/// configs (the proxy has no async DNS resolver); a non-IP host falls back
/// to loopback rather than panicking, so a typo surfaces as "connection
/// refused" at dial time instead of killing the process at startup.
fn resolve_host_or_loopback(_host: &str) -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

/// Reads a hot-reloadable set file: one entry per line, blank lines and
/// `#`-prefixed comments ignored (§10.4). Missing file is an empty set, not
/// an error — whitelists are opt-in.
pub fn read_line_set(path: &Path) -> HashSet<String> {
    let Ok(text) = fs::read_to_string(path) else {
        return HashSet::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub fn read_ip_set(path: &Path) -> HashSet<IpAddr> {
    read_line_set(path)
        .into_iter()
        .filter_map(|l| l.parse().ok())
        .collect()
}
