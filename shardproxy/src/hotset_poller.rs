//! Background poller for the hot-reloadable sets (§10.4): re-reads each
//! configured file on `poll_interval` and republishes through the `HotSet`'s
//! `ArcSwap`, without ever touching the event-loop's `Core`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shardproxy_core::hotset::HotSet;
use tracing::debug;

use crate::config::{read_ip_set, read_line_set};

pub fn spawn_ip_whitelist(set: Arc<HotSet<IpAddr>>, path: Option<PathBuf>, interval: Duration) {
    let Some(path) = path else { return };
    thread::Builder::new()
        .name("shardproxy-whitelist-poll".to_string())
        .spawn(move || loop {
            set.publish(read_ip_set(&path));
            debug!(?path, "refreshed IP whitelist");
            thread::sleep(interval);
        })
        .expect("failed to spawn whitelist poller thread");
}

pub fn spawn_string_set(name: &'static str, set: Arc<HotSet<String>>, path: Option<PathBuf>, interval: Duration) {
    let Some(path) = path else { return };
    thread::Builder::new()
        .name(format!("shardproxy-{name}-poll"))
        .spawn(move || loop {
            set.publish(read_line_set(&path));
            debug!(?path, set = name, "refreshed hot-reloadable set");
            thread::sleep(interval);
        })
        .expect("failed to spawn hotset poller thread");
}
