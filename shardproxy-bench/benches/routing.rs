//! Ketama continuum lookup throughput and rebuild cost as backend count
//! grows (§4.E).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shardproxy_core::hash::{Distribution, HashFn};
use shardproxy_core::pool::backend::BackendServer;
use shardproxy_core::pool::{PoolRuntimeConfig, ServerPool};
use shardproxy_core::protocol::Wire;

fn backend(idx: u8) -> BackendServer {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, idx, 1)), 6379);
    BackendServer::new(format!("shard{idx}"), addr, 1, vec![])
}

fn pool_config() -> PoolRuntimeConfig {
    PoolRuntimeConfig {
        name: "bench".into(),
        listen: "127.0.0.1:0".parse().unwrap(),
        hash_fn: HashFn::Md5,
        hash_tag: None,
        distribution: Distribution::Ketama,
        timeout: Duration::from_millis(400),
        backlog: 512,
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

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("continuum_route");
    for &backend_count in &[4u8, 32, 200] {
        let backends: Vec<BackendServer> = (0..backend_count).map(backend).collect();
        let pool = ServerPool::new(pool_config(), backends);
        group.bench_with_input(
            BenchmarkId::from_parameter(backend_count),
            &pool,
            |b, pool| {
                let mut i: u64 = 0;
                b.iter(|| {
                    i += 1;
                    let key = format!("key_{i}");
                    black_box(pool.route(key.as_bytes()))
                });
            },
        );
    }
    group.finish();
}

fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("continuum_rebuild");
    for &backend_count in &[4u8, 32, 200] {
        group.bench_with_input(
            BenchmarkId::from_parameter(backend_count),
            &backend_count,
            |b, &backend_count| {
                b.iter(|| {
                    let backends: Vec<BackendServer> = (0..backend_count).map(backend).collect();
                    black_box(ServerPool::new(pool_config(), backends));
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_route, bench_rebuild);
criterion_main!(benches);
