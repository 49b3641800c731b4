//! Typed runtime configuration (§10.1): a YAML document maps pool name to
//! [`PoolConfig`], plus top-level [`RuntimeConfig`] knobs (§6). Structs
//! derive `Deserialize` and are validated in a separate pass after parsing
//! — the same plain-struct-plus-`validate()` split the teacher stack uses
//! for its own YAML-driven config, rather than serde validator attributes.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::hash::{Distribution, HashFn};
use crate::protocol::Wire;

fn default_timeout() -> Duration {
    Duration::from_millis(400)
}

fn default_backlog() -> u32 {
    512
}

fn default_client_connections() -> usize {
    1024
}

fn default_server_connections() -> usize {
    1
}

fn default_server_retry_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_server_failure_limit() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

/// One backend line as written in YAML: `host:port:weight [name]`, optionally
/// followed by `slave_of` addresses. Kept as a flat struct rather than a
/// single delimited string field so the YAML stays readable; the
/// `host:port:weight` wire shape from the spec's §6 is still accepted via
/// [`BackendLine::parse`] for configs that prefer the compact form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BackendEntry {
    Compact(String),
    Full {
        host: String,
        port: u16,
        #[serde(default = "default_weight")]
        weight: u32,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        slaves: Vec<String>,
    },
}

fn default_weight() -> u32 {
    1
}

/// A fully resolved backend after parsing/validation.
#[derive(Debug, Clone)]
pub struct BackendLine {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub name: String,
    pub slaves: Vec<SocketAddr>,
}

impl BackendEntry {
    /// Resolves this entry into a [`BackendLine`], hand-parsing the compact
    /// `host:port:weight [name]` form — this is wire-format-shaped data, not
    /// a place to reach for a parser-combinator crate (§10.1).
    fn resolve(&self, pool: &str) -> Result<BackendLine, ConfigError> {
        match self {
            BackendEntry::Full {
                host,
                port,
                weight,
                name,
                slaves,
            } => {
                let slaves = slaves
                    .iter()
                    .map(|s| parse_socket_addr(pool, s))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(BackendLine {
                    host: host.clone(),
                    port: *port,
                    weight: *weight,
                    name: name.clone().unwrap_or_else(|| format!("{host}:{port}")),
                    slaves,
                })
            }
            BackendEntry::Compact(line) => parse_compact_backend_line(pool, line),
        }
    }
}

fn parse_socket_addr(pool: &str, s: &str) -> Result<SocketAddr, ConfigError> {
    s.parse().map_err(|_| ConfigError::MalformedBackend {
        pool: pool.to_string(),
        line: s.to_string(),
        reason: "not a valid host:port address".to_string(),
    })
}

/// Parses one compact backend line: `host:port:weight [name]`, optionally
/// followed by whitespace-separated `slave_host:slave_port` entries.
fn parse_compact_backend_line(pool: &str, line: &str) -> Result<BackendLine, ConfigError> {
    let malformed = |reason: &str| ConfigError::MalformedBackend {
        pool: pool.to_string(),
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let mut tokens = line.split_whitespace();
    let primary = tokens.next().ok_or_else(|| malformed("empty backend line"))?;
    let mut parts = primary.splitn(3, ':');
    let host = parts.next().ok_or_else(|| malformed("missing host"))?.to_string();
    let port: u16 = parts
        .next()
        .ok_or_else(|| malformed("missing port"))?
        .parse()
        .map_err(|_| malformed("port is not a valid u16"))?;
    let weight: u32 = match parts.next() {
        Some(w) if !w.is_empty() => w.parse().map_err(|_| malformed("weight is not a valid u32"))?,
        _ => 1,
    };

    // The optional `[name]` token is the next whitespace-separated token, if
    // any — distinguished from a slave address by the absence of a colon.
    let mut rest: Vec<&str> = tokens.collect();
    let name = if rest.first().map(|t| !t.contains(':')).unwrap_or(false) {
        rest.remove(0).to_string()
    } else {
        format!("{host}:{port}")
    };

    let mut slaves = Vec::new();
    for tok in rest {
        slaves.push(parse_socket_addr(pool, tok)?);
    }

    Ok(BackendLine {
        host,
        port,
        weight,
        name,
        slaves,
    })
}

/// Per-pool configuration as read from YAML (§6, §10.1).
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub listen: String,
    #[serde(default)]
    pub hash: Option<HashFn>,
    #[serde(default)]
    pub hash_tag: Option<String>,
    #[serde(default)]
    pub distribution: Option<Distribution>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_client_connections")]
    pub client_connections: usize,
    #[serde(default = "default_true")]
    pub redis: bool,
    #[serde(default)]
    pub preconnect: bool,
    #[serde(default = "default_true")]
    pub auto_eject_hosts: bool,
    #[serde(default = "default_server_connections")]
    pub server_connections: usize,
    #[serde(default = "default_server_retry_timeout", with = "humantime_serde")]
    pub server_retry_timeout: Duration,
    #[serde(default = "default_server_failure_limit")]
    pub server_failure_limit: u32,
    #[serde(default)]
    pub flow_control: bool,
    #[serde(default)]
    pub quota: u64,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_auth: Option<String>,
    pub servers: Vec<BackendEntry>,
}

/// Top-level runtime knobs, outside any single pool (§6 "Runtime knobs").
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub verbosity: u8,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default)]
    pub stats_listen: Option<String>,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    #[serde(default)]
    pub sentinel: Option<String>,
    #[serde(default = "default_sentinel_reconnect_ms")]
    pub sentinel_reconnect_interval_ms: u64,
    #[serde(default = "default_mbuf_size")]
    pub mbuf_size: usize,
    #[serde(default)]
    pub maxmemory_mb: usize,
    #[serde(default = "default_slow_query_ms")]
    pub slow_query_threshold_ms: u64,
    #[serde(default)]
    pub slow_log_file: Option<PathBuf>,
    #[serde(default)]
    pub gray_list_file: Option<PathBuf>,
    #[serde(default)]
    pub broadcast_whitelist_file: Option<PathBuf>,
    #[serde(default)]
    pub whitelist_file: Option<PathBuf>,
    #[serde(default = "default_hotset_poll_ms")]
    pub hotset_poll_interval_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub client_keepalive_secs: u64,
    #[serde(default = "default_pipeline_limit")]
    pub pipeline_limit: usize,
    #[serde(default = "default_pipeline_resume")]
    pub pipeline_resume_threshold: usize,
}

fn default_stats_interval_ms() -> u64 {
    10_000
}
fn default_sentinel_reconnect_ms() -> u64 {
    1_000
}
fn default_mbuf_size() -> usize {
    crate::buffer::DEFAULT_CHUNK_SIZE
}
fn default_slow_query_ms() -> u64 {
    100
}
fn default_hotset_poll_ms() -> u64 {
    5_000
}
fn default_keepalive_secs() -> u64 {
    120
}
/// `NUT_PIPELINE_LIMIT` from §5: the pipeline depth at which reads are
/// paused once the memory ceiling is also exceeded.
fn default_pipeline_limit() -> usize {
    100
}
fn default_pipeline_resume() -> usize {
    50
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            verbosity: 0,
            log_file: None,
            pid_file: None,
            stats_listen: None,
            stats_interval_ms: default_stats_interval_ms(),
            sentinel: None,
            sentinel_reconnect_interval_ms: default_sentinel_reconnect_ms(),
            mbuf_size: default_mbuf_size(),
            maxmemory_mb: 0,
            slow_query_threshold_ms: default_slow_query_ms(),
            slow_log_file: None,
            gray_list_file: None,
            broadcast_whitelist_file: None,
            whitelist_file: None,
            hotset_poll_interval_ms: default_hotset_poll_ms(),
            client_keepalive_secs: default_keepalive_secs(),
            pipeline_limit: default_pipeline_limit(),
            pipeline_resume_threshold: default_pipeline_resume(),
        }
    }
}

/// The raw deserialized document shape: `pools:` map plus top-level runtime
/// knobs flattened alongside it.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    pools: HashMap<String, PoolConfig>,
    #[serde(flatten, default)]
    runtime: RuntimeConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub pools: HashMap<String, PoolConfig>,
    pub runtime: RuntimeConfig,
}

impl ProxyConfig {
    /// Loads and validates a configuration file (§10.1). Used directly by
    /// `--test-conf` as well as normal startup.
    pub fn load_file(path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load_str(&text, path)
    }

    fn load_str(text: &str, path: &Path) -> Result<ProxyConfig, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let config = ProxyConfig {
            pools: raw.pools,
            runtime: raw.runtime,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validation pass run once after parsing (§10.1): at least one pool, at
    /// least one backend per pool, `server_connections >= 1`, `timeout > 0`,
    /// and hash/distribution names resolved from a closed enum by serde
    /// already — anything that doesn't parse as `HashFn`/`Distribution`
    /// surfaces as a `ConfigError::Parse`, not a silent default.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::NoPools);
        }
        for (name, pool) in &self.pools {
            if pool.servers.is_empty() {
                return Err(ConfigError::InvalidPool {
                    pool: name.clone(),
                    reason: "pool has no backends".to_string(),
                });
            }
            if pool.server_connections == 0 {
                return Err(ConfigError::InvalidValue {
                    pool: name.clone(),
                    field: "server_connections",
                    value: pool.server_connections.to_string(),
                });
            }
            if pool.timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    pool: name.clone(),
                    field: "timeout",
                    value: format!("{:?}", pool.timeout),
                });
            }
            let _: SocketAddr = pool.listen.parse().map_err(|_| ConfigError::InvalidValue {
                pool: name.clone(),
                field: "listen",
                value: pool.listen.clone(),
            })?;
            for entry in &pool.servers {
                entry.resolve(name)?;
            }
            if let Some(tag) = &pool.hash_tag {
                if tag.len() != 2 {
                    return Err(ConfigError::InvalidValue {
                        pool: name.clone(),
                        field: "hash_tag",
                        value: tag.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolves one pool's backend entries into [`BackendLine`]s; called by
    /// the binary when building the runtime `ServerPool` for each configured
    /// pool (validation already proved every entry parses).
    pub fn resolve_backends(&self, pool_name: &str) -> Result<Vec<BackendLine>, ConfigError> {
        let pool = self
            .pools
            .get(pool_name)
            .ok_or_else(|| ConfigError::InvalidPool {
                pool: pool_name.to_string(),
                reason: "unknown pool".to_string(),
            })?;
        pool.servers.iter().map(|e| e.resolve(pool_name)).collect()
    }
}

impl PoolConfig {
    pub fn hash_tag_bytes(&self) -> Option<(u8, u8)> {
        let tag = self.hash_tag.as_ref()?;
        let bytes = tag.as_bytes();
        (bytes.len() == 2).then(|| (bytes[0], bytes[1]))
    }

    pub fn wire(&self) -> Wire {
        if self.redis {
            Wire::Resp
        } else {
            Wire::Memcache
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    pub fn server_retry_timeout_duration(&self) -> Duration {
        self.server_retry_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
verbosity: 1
pools:
  pool1:
    listen: "127.0.0.1:6400"
    hash: md5
    distribution: ketama
    timeout: "400ms"
    servers:
      - "10.0.0.1:6379:1 shard1"
      - "10.0.0.2:6379:1 shard2"
"#
    }

    #[test]
    fn loads_minimal_valid_config() {
        let cfg = ProxyConfig::load_str(minimal_yaml(), Path::new("test.yaml")).unwrap();
        assert_eq!(cfg.pools.len(), 1);
        assert_eq!(cfg.runtime.verbosity, 1);
        let backends = cfg.resolve_backends("pool1").unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].name, "shard1");
        assert_eq!(backends[0].weight, 1);
    }

    #[test]
    fn rejects_empty_pool_map() {
        let err = ProxyConfig::load_str("pools: {}\n", Path::new("test.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NoPools));
    }

    #[test]
    fn rejects_pool_with_no_backends() {
        let yaml = r#"
pools:
  pool1:
    listen: "127.0.0.1:6400"
    servers: []
"#;
        let err = ProxyConfig::load_str(yaml, Path::new("test.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPool { .. }));
    }

    #[test]
    fn rejects_malformed_backend_line() {
        let yaml = r#"
pools:
  pool1:
    listen: "127.0.0.1:6400"
    servers:
      - "not-a-valid-line"
"#;
        let err = ProxyConfig::load_str(yaml, Path::new("test.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedBackend { .. }));
    }

    #[test]
    fn parses_backend_line_with_slaves() {
        let line = parse_compact_backend_line("pool1", "10.0.0.1:6379:2 shard1 10.0.0.2:6379").unwrap();
        assert_eq!(line.weight, 2);
        assert_eq!(line.name, "shard1");
        assert_eq!(line.slaves.len(), 1);
    }
}
