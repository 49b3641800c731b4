//! Tiny load generator for a running `shardproxy` instance (§1/§6a "built-in
//! benchmarking tool" — the external collaborator the core crate assumes
//! exists but never talks to directly). Opens `--connections` sockets, each
//! pipelining a configurable depth of GET/SET requests in a loop for
//! `--duration` seconds, then reports aggregate request throughput.
//!
//! Deliberately a plain `std::net` + threads tool, not a second async
//! runtime or a `clap` CLI: this binary exists to drive the proxy during
//! manual testing, not to ship as a product surface.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shardproxy_core::parser::resp::encode_multibulk;

struct Args {
    addr: String,
    connections: usize,
    pipeline: usize,
    duration: Duration,
    write_ratio: u8,
}

fn parse_args() -> Args {
    let mut addr = "127.0.0.1:6400".to_string();
    let mut connections = 16usize;
    let mut pipeline = 8usize;
    let mut duration = Duration::from_secs(10);
    let mut write_ratio = 10u8;

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = || iter.next().unwrap_or_else(|| panic!("missing value for {flag}"));
        match flag.as_str() {
            "--addr" => addr = value(),
            "--connections" => connections = value().parse().expect("--connections is not a number"),
            "--pipeline" => pipeline = value().parse().expect("--pipeline is not a number"),
            "--duration-secs" => duration = Duration::from_secs(value().parse().expect("--duration-secs is not a number")),
            "--write-ratio" => write_ratio = value().parse().expect("--write-ratio is not 0-100"),
            other => panic!("unknown flag {other}"),
        }
    }
    Args { addr, connections, pipeline, duration, write_ratio }
}

/// One worker's request mix for a batch of `pipeline` requests: roughly
/// `write_ratio` percent SETs, the rest GETs, deterministic per batch index
/// so throughput runs are reproducible.
fn build_batch(worker: usize, batch: u64, pipeline: usize, write_ratio: u8) -> Vec<u8> {
    let mut buf = Vec::new();
    for i in 0..pipeline {
        let key = format!("loadgen:{worker}:{i}");
        let slot = ((batch as usize + i) * 7) % 100;
        if (slot as u8) < write_ratio {
            let value = format!("v{batch}");
            buf.extend(encode_multibulk("SET", [key.as_bytes(), value.as_bytes()]));
        } else {
            buf.extend(encode_multibulk("GET", [key.as_bytes()]));
        }
    }
    buf
}

fn worker_loop(addr: String, worker: usize, pipeline: usize, write_ratio: u8, deadline: Instant, completed: Arc<AtomicU64>) {
    let mut stream = match TcpStream::connect(&addr) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("loadgen: worker {worker} failed to connect to {addr}: {err}");
            return;
        }
    };
    stream.set_nodelay(true).ok();

    let mut batch: u64 = 0;
    let mut read_buf = [0u8; 16 * 1024];
    while Instant::now() < deadline {
        let request = build_batch(worker, batch, pipeline, write_ratio);
        if stream.write_all(&request).is_err() {
            break;
        }
        // Pipelined replies may arrive split across several reads; keep
        // reading until we've seen at least `pipeline` reply terminators
        // worth of bytes, which for this fixed GET/SET mix is "enough
        // bytes that the socket would otherwise block" — good enough for
        // a throughput estimate, not a correctness check.
        let mut received = 0usize;
        while received < request.len() / 2 {
            match stream.read(&mut read_buf) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(_) => break,
            }
        }
        completed.fetch_add(pipeline as u64, Ordering::Relaxed);
        batch += 1;
    }
}

fn main() {
    let args = parse_args();
    let completed = Arc::new(AtomicU64::new(0));
    let deadline = Instant::now() + args.duration;

    println!(
        "loadgen: {} connections x {} pipeline depth against {} for {:?} ({}% writes)",
        args.connections, args.pipeline, args.addr, args.duration, args.write_ratio
    );

    let handles: Vec<_> = (0..args.connections)
        .map(|worker| {
            let addr = args.addr.clone();
            let completed = Arc::clone(&completed);
            let pipeline = args.pipeline;
            let write_ratio = args.write_ratio;
            thread::Builder::new()
                .name(format!("loadgen-{worker}"))
                .spawn(move || worker_loop(addr, worker, pipeline, write_ratio, deadline, completed))
                .expect("failed to spawn loadgen worker thread")
        })
        .collect();

    for h in handles {
        let _ = h.join();
    }

    let total = completed.load(Ordering::Relaxed);
    let secs = args.duration.as_secs_f64();
    println!("loadgen: {total} requests completed in {secs:.1}s ({:.0} req/s)", total as f64 / secs);
}
