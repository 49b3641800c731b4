//! `shardproxy`: the binary crate wiring CLI, configuration, logging,
//! daemonization, the stats endpoint, and hot-reloadable sets around
//! `shardproxy-core`'s event loop (§6a, §10).

mod cli;
mod config;
mod daemon;
mod hotset_poller;
mod logging;
mod stats_http;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use shardproxy_core::event_loop::Core;
use tracing::{error, info};

/// `warn_msg_reset_interval` (§4.J): how often each pool's quota bucket
/// refills back to its configured `quota`.
const QUOTA_REFILL_INTERVAL: Duration = Duration::from_secs(120);

fn main() {
    let cli = cli::Cli::parse();

    match run(&cli) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            // Logging may not be initialized yet (a config load failure
            // happens before `logging::init`), so always echo to stderr too.
            eprintln!("shardproxy: {err:#}");
            error!("{err:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: &cli::Cli) -> Result<()> {
    let mut proxy_config =
        config::load(&cli.conf_file).with_context(|| format!("loading {}", cli.conf_file.display()))?;
    cli.apply_overrides(&mut proxy_config.runtime);

    if cli.test_conf {
        println!(
            "configuration OK: {} pool(s) in {}",
            proxy_config.pools.len(),
            cli.conf_file.display()
        );
        return Ok(());
    }

    let _guards = logging::init(
        proxy_config.runtime.verbosity,
        proxy_config.runtime.log_file.as_deref(),
        proxy_config.runtime.slow_log_file.as_deref(),
    );

    if cli.daemonize {
        daemon::daemonize().context("daemonizing")?;
    }
    if let Some(pid_file) = &proxy_config.runtime.pid_file {
        daemon::write_pid_file(pid_file).context("writing pid file")?;
    }

    let pools = config::build_pools(&proxy_config).context("building pools from configuration")?;

    let mut core = Core::new(
        proxy_config.runtime.mbuf_size,
        proxy_config.runtime.maxmemory_mb * 1024 * 1024,
        proxy_config.runtime.pipeline_limit,
        proxy_config.runtime.pipeline_resume_threshold,
        QUOTA_REFILL_INTERVAL,
        Duration::from_millis(proxy_config.runtime.sentinel_reconnect_interval_ms),
    )
    .context("initializing event loop core")?;
    core.set_client_keepalive(Some(Duration::from_secs(proxy_config.runtime.client_keepalive_secs)));

    if cli.describe_stats {
        stats_http::describe(&core.stats.registry);
        return Ok(());
    }

    for pool in pools {
        let name = pool.config.name.clone();
        core.add_pool(pool).with_context(|| format!("binding listener for pool {name}"))?;
        info!(pool = %name, "pool listener bound");
    }

    if let Some(sentinel) = &proxy_config.runtime.sentinel {
        let addr: SocketAddr = sentinel
            .parse()
            .with_context(|| format!("invalid sentinel address {sentinel:?}"))?;
        core.configure_sentinel(addr);
        info!(%addr, "sentinel configured");
    }

    if let Some(stats_listen) = &proxy_config.runtime.stats_listen {
        let addr: SocketAddr = stats_listen
            .parse()
            .with_context(|| format!("invalid stats_listen address {stats_listen:?}"))?;
        stats_http::spawn(addr, core.stats.registry.clone());
        info!(%addr, "stats endpoint listening");
    }

    let poll_interval = Duration::from_millis(proxy_config.runtime.hotset_poll_interval_ms);
    hotset_poller::spawn_ip_whitelist(
        std::sync::Arc::clone(&core.whitelist),
        proxy_config.runtime.whitelist_file.clone(),
        poll_interval,
    );
    hotset_poller::spawn_string_set(
        "gray-list",
        std::sync::Arc::clone(&core.gray_list),
        proxy_config.runtime.gray_list_file.clone(),
        poll_interval,
    );
    hotset_poller::spawn_string_set(
        "broadcast-whitelist",
        std::sync::Arc::clone(&core.broadcast_whitelist),
        proxy_config.runtime.broadcast_whitelist_file.clone(),
        poll_interval,
    );

    info!("shardproxy starting event loop");
    core.run().context("event loop")?;
    Ok(())
}
