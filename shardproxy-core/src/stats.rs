//! Core counters (§10.5), exposed through a `prometheus::Registry` the
//! binary's stats HTTP endpoint renders as text exposition on an interval.
//! Counters are incremented from the single event-loop thread and read by
//! the stats thread, which is exactly the split `AtomicU64`/atomic-handoff
//! model in §5 calls for — `prometheus`'s own counter types already use
//! atomics internally, so no extra locking is needed here.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

pub struct CoreStats {
    pub registry: Registry,
    pub connections_accepted: IntCounterVec,
    pub connections_closed: IntCounterVec,
    pub parse_errors: IntCounterVec,
    pub forbidden_commands: IntCounterVec,
    pub quota_rejections: IntCounterVec,
    pub backend_ejections: IntCounterVec,
    pub fragments_dispatched: IntCounterVec,
    pub pool_token_level: IntGaugeVec,
    pub outstanding_buffer_bytes: IntGauge,
}

impl CoreStats {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_accepted = IntCounterVec::new(
            Opts::new("shardproxy_connections_accepted_total", "Connections accepted, by role"),
            &["role"],
        )
        .unwrap();
        let connections_closed = IntCounterVec::new(
            Opts::new("shardproxy_connections_closed_total", "Connections closed, by role"),
            &["role"],
        )
        .unwrap();
        let parse_errors = IntCounterVec::new(
            Opts::new("shardproxy_parse_errors_total", "Protocol parse errors, by pool"),
            &["pool"],
        )
        .unwrap();
        let forbidden_commands = IntCounterVec::new(
            Opts::new("shardproxy_forbidden_commands_total", "Commands rejected by the permission filter"),
            &["pool"],
        )
        .unwrap();
        let quota_rejections = IntCounterVec::new(
            Opts::new("shardproxy_quota_rejections_total", "Requests rejected by the quota gate"),
            &["pool"],
        )
        .unwrap();
        let backend_ejections = IntCounterVec::new(
            Opts::new("shardproxy_backend_ejections_total", "Backends ejected from the continuum"),
            &["pool", "backend"],
        )
        .unwrap();
        let fragments_dispatched = IntCounterVec::new(
            Opts::new("shardproxy_fragments_dispatched_total", "Fragment children dispatched"),
            &["pool", "command"],
        )
        .unwrap();
        let pool_token_level = IntGaugeVec::new(
            Opts::new("shardproxy_pool_token_level", "Current quota token level, by pool"),
            &["pool"],
        )
        .unwrap();
        let outstanding_buffer_bytes = IntGauge::new(
            "shardproxy_outstanding_buffer_bytes",
            "Total bytes outstanding across all pooled buffer chunks",
        )
        .unwrap();

        for c in [
            &connections_accepted,
            &connections_closed,
            &parse_errors,
            &forbidden_commands,
            &quota_rejections,
            &backend_ejections,
            &fragments_dispatched,
        ] {
            registry.register(Box::new(c.clone())).unwrap();
        }
        registry.register(Box::new(pool_token_level.clone())).unwrap();
        registry.register(Box::new(outstanding_buffer_bytes.clone())).unwrap();

        CoreStats {
            registry,
            connections_accepted,
            connections_closed,
            parse_errors,
            forbidden_commands,
            quota_rejections,
            backend_ejections,
            fragments_dispatched,
            pool_token_level,
            outstanding_buffer_bytes,
        }
    }
}

impl Default for CoreStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_without_collision() {
        let stats = CoreStats::new();
        assert!(!stats.registry.gather().is_empty());
        stats.connections_accepted.with_label_values(&["client"]).inc();
        let families = stats.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "shardproxy_connections_accepted_total")
            .unwrap();
        assert_eq!(family.get_metric()[0].get_counter().get_value(), 1.0);
    }
}
