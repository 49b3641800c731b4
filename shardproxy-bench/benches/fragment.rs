//! Fragment/coalesce engine throughput for `MGET` fan-out across a growing
//! key count and shard count (§4.G).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shardproxy_core::fragment::{coalesce, fragment_multi_key};
use shardproxy_core::message::{Command, KeyRange};
use shardproxy_core::parser::resp::RespValue;

fn key(i: usize) -> KeyRange {
    let value = format!("key_{i}").into_bytes();
    KeyRange {
        start: 0,
        end: 0,
        value,
        pair_value: None,
    }
}

fn bench_fragment_mget(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragment_mget");
    for &(n_keys, n_shards) in &[(8usize, 2usize), (64, 8), (512, 32)] {
        let keys: Vec<KeyRange> = (0..n_keys).map(key).collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{n_keys}keys_{n_shards}shards")),
            &keys,
            |b, keys| {
                b.iter(|| {
                    let frags = fragment_multi_key(&Command::MGet, keys, |k| {
                        // cheap stand-in for a real route() call: spread
                        // keys across n_shards deterministically by byte sum.
                        (k.iter().map(|&b| b as usize).sum::<usize>()) % n_shards
                    });
                    black_box(frags);
                });
            },
        );
    }
    group.finish();
}

fn bench_coalesce_mget(c: &mut Criterion) {
    let mut group = c.benchmark_group("coalesce_mget");
    for &n_keys in &[8usize, 64, 512] {
        let key_indices: Vec<Vec<usize>> = (0..n_keys).map(|i| vec![i]).collect();
        let replies: Vec<RespValue> = (0..n_keys)
            .map(|i| RespValue::Bulk(Some(format!("val_{i}").into_bytes())))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n_keys), &n_keys, |b, &n_keys| {
            b.iter(|| {
                black_box(coalesce(&Command::MGet, &replies, &key_indices, n_keys));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fragment_mget, bench_coalesce_mget);
criterion_main!(benches);
