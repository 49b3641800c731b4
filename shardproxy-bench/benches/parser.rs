//! Throughput of the RESP request parser against pipelined multi-bulk
//! commands of varying key counts (§4.C).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shardproxy_core::parser::resp::{encode_multibulk, parse_request};

fn mget_request(n: usize) -> Vec<u8> {
    let keys: Vec<String> = (0..n).map(|i| format!("key_{i}")).collect();
    let args: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
    encode_multibulk("MGET", args)
}

fn bench_parse_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_request");
    for &n in &[1usize, 8, 64, 256] {
        let buf = mget_request(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &buf, |b, buf| {
            b.iter(|| {
                let outcome = parse_request(black_box(buf)).unwrap();
                black_box(outcome);
            });
        });
    }
    group.finish();
}

fn bench_parse_inline(c: &mut Criterion) {
    let buf = b"GET key_1\r\n".to_vec();
    c.bench_function("parse_request_inline", |b| {
        b.iter(|| {
            let outcome = parse_request(black_box(&buf)).unwrap();
            black_box(outcome);
        });
    });
}

criterion_group!(benches, bench_parse_request, bench_parse_inline);
criterion_main!(benches);
