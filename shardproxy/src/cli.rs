//! Command-line surface (§6, §10.2): every runtime knob the config file can
//! also carry, plus the process-control flags that only make sense as
//! arguments (`--test-conf`, `--describe-stats`, `-d`/`--daemonize`).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "shardproxy", author, version, about = "Sharding proxy for the Redis wire protocol", long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "conf-file")]
    pub conf_file: PathBuf,

    /// Increase verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Write logs to this file instead of stderr.
    #[arg(short = 'o', long = "output")]
    pub log_file: Option<PathBuf>,

    /// Run as a daemon (fork, detach, write a pid file).
    #[arg(short = 'd', long = "daemonize")]
    pub daemonize: bool,

    /// Pid file path, used when `--daemonize` is set.
    #[arg(short = 'p', long = "pid-file")]
    pub pid_file: Option<PathBuf>,

    /// Load and validate the configuration, print the result, and exit
    /// (0 if valid, 1 otherwise) without binding any sockets.
    #[arg(short = 't', long = "test-conf")]
    pub test_conf: bool,

    /// Print the registered stats metric names and help strings, then exit.
    #[arg(long = "describe-stats")]
    pub describe_stats: bool,

    /// Stats HTTP listen address, e.g. "0.0.0.0:9512"; overrides the config
    /// file's `stats_listen`.
    #[arg(short = 's', long = "stats-listen")]
    pub stats_listen: Option<String>,

    /// Stats exposition refresh interval, in milliseconds.
    #[arg(long = "stats-interval")]
    pub stats_interval_ms: Option<u64>,

    /// Redis Sentinel address to subscribe to for master-switch
    /// notifications, e.g. "127.0.0.1:26379".
    #[arg(long = "sentinel")]
    pub sentinel: Option<String>,

    /// Sentinel reconnect backoff, in milliseconds.
    #[arg(long = "sentinel-reconnect-interval")]
    pub sentinel_reconnect_interval_ms: Option<u64>,

    /// Pooled buffer chunk size in bytes (512 - 65536).
    #[arg(short = 'm', long = "mbuf-size")]
    pub mbuf_size: Option<usize>,

    /// Soft memory ceiling across all pooled buffers, in megabytes (0 =
    /// unbounded).
    #[arg(long = "maxmemory")]
    pub maxmemory_mb: Option<usize>,

    /// Requests slower than this (in milliseconds) are recorded to the
    /// slow-log.
    #[arg(long = "slow-query-threshold")]
    pub slow_query_threshold_ms: Option<u64>,

    /// Slow-log output file.
    #[arg(long = "slow-log-file")]
    pub slow_log_file: Option<PathBuf>,

    /// File listing gray-listed commands, one per line; hot-reloaded.
    #[arg(long = "gray-list-file")]
    pub gray_list_file: Option<PathBuf>,

    /// File listing BROADCAST-permitted command names, one per line;
    /// hot-reloaded. Absent or empty means no restriction.
    #[arg(long = "broadcast-whitelist-file")]
    pub broadcast_whitelist_file: Option<PathBuf>,

    /// File listing client IP addresses permitted to connect, one per
    /// line; hot-reloaded. Absent or empty means no restriction.
    #[arg(long = "whitelist-file")]
    pub whitelist_file: Option<PathBuf>,

    /// Client TCP keepalive, in seconds.
    #[arg(long = "client-keepalive")]
    pub client_keepalive_secs: Option<u64>,
}

impl Cli {
    /// Overlays the CLI flags that were actually supplied onto a freshly
    /// loaded [`shardproxy_core::config::RuntimeConfig`] — CLI wins over the
    /// file, the file's own defaults win over neither (§10.1/§10.2).
    pub fn apply_overrides(&self, runtime: &mut shardproxy_core::config::RuntimeConfig) {
        if self.verbosity > 0 {
            runtime.verbosity = self.verbosity;
        }
        if self.log_file.is_some() {
            runtime.log_file = self.log_file.clone();
        }
        if self.pid_file.is_some() {
            runtime.pid_file = self.pid_file.clone();
        }
        if self.stats_listen.is_some() {
            runtime.stats_listen = self.stats_listen.clone();
        }
        if let Some(ms) = self.stats_interval_ms {
            runtime.stats_interval_ms = ms;
        }
        if self.sentinel.is_some() {
            runtime.sentinel = self.sentinel.clone();
        }
        if let Some(ms) = self.sentinel_reconnect_interval_ms {
            runtime.sentinel_reconnect_interval_ms = ms;
        }
        if let Some(size) = self.mbuf_size {
            runtime.mbuf_size = size.clamp(512, 64 * 1024);
        }
        if let Some(mb) = self.maxmemory_mb {
            runtime.maxmemory_mb = mb;
        }
        if let Some(ms) = self.slow_query_threshold_ms {
            runtime.slow_query_threshold_ms = ms;
        }
        if self.slow_log_file.is_some() {
            runtime.slow_log_file = self.slow_log_file.clone();
        }
        if self.gray_list_file.is_some() {
            runtime.gray_list_file = self.gray_list_file.clone();
        }
        if self.broadcast_whitelist_file.is_some() {
            runtime.broadcast_whitelist_file = self.broadcast_whitelist_file.clone();
        }
        if self.whitelist_file.is_some() {
            runtime.whitelist_file = self.whitelist_file.clone();
        }
        if let Some(secs) = self.client_keepalive_secs {
            runtime.client_keepalive_secs = secs;
        }
    }
}
