//! Stats HTTP endpoint (§10.5): a background thread owning a
//! `std::net::TcpListener`, serving the `shardproxy-core` counters as
//! Prometheus text exposition. Deliberately minimal — one-shot responses,
//! no keep-alive, no routing — pulling in `axum`/`hyper` for a single text
//! response would be exactly the over-engineering this repository avoids.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

use prometheus::{Encoder, Registry, TextEncoder};
use tracing::warn;

/// Spawns the stats thread and returns immediately; the thread runs for the
/// lifetime of the process.
pub fn spawn(addr: SocketAddr, registry: Registry) {
    thread::Builder::new()
        .name("shardproxy-stats".to_string())
        .spawn(move || serve(addr, &registry))
        .expect("failed to spawn stats HTTP thread");
}

fn serve(addr: SocketAddr, registry: &Registry) {
    let listener = match TcpListener::bind(addr) {
        Ok(l) => l,
        Err(err) => {
            warn!(%addr, %err, "failed to bind stats HTTP listener");
            return;
        }
    };
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => handle_one(stream, registry),
            Err(err) => warn!(%err, "stats listener accept error"),
        }
    }
}

/// Reads and discards the request line/headers (the only routes this
/// listener serves are `GET /metrics` and `GET /`, both answered
/// identically), then writes one text-exposition response and closes.
fn handle_one(mut stream: TcpStream, registry: &Registry) {
    let mut buf = [0u8; 1024];
    // Best-effort drain of whatever the client already sent; a stats
    // scraper's request is tiny and arrives before we get here in
    // practice, so this doesn't need to loop until a blank line.
    let _ = std::io::Read::read(&mut stream, &mut buf);

    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut body = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut body) {
        warn!(%err, "failed to encode stats");
        return;
    }

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        encoder.format_type(),
        body.len()
    );
    if stream.write_all(header.as_bytes()).is_ok() {
        let _ = stream.write_all(&body);
    }
}

/// Prints the registered metric names and help strings without starting any
/// listener (`--describe-stats`, §10.2).
pub fn describe(registry: &Registry) {
    for family in registry.gather() {
        println!("{}: {}", family.get_name(), family.get_help());
    }
}
