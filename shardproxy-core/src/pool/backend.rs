//! Backend server bookkeeping (§3 "Backend server", §4.E/§4.F).

use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Online,
    KickedOut,
    Replaced,
}

#[derive(Debug, Clone)]
pub struct BackendServer {
    pub name: String,
    pub addr: SocketAddr,
    pub slaves: Vec<SocketAddr>,
    pub weight: u32,
    pub failure_count: u32,
    pub next_retry: Option<Instant>,
    pub status: BackendStatus,
    /// Round-robin cursor into `slaves` for read-only command routing
    /// (§4.F "Master-slave slave selection").
    slave_cursor: usize,
}

impl BackendServer {
    pub fn new(name: String, addr: SocketAddr, weight: u32, slaves: Vec<SocketAddr>) -> Self {
        BackendServer {
            name,
            addr,
            slaves,
            weight,
            failure_count: 0,
            next_retry: None,
            status: BackendStatus::Online,
            slave_cursor: 0,
        }
    }

    pub fn is_ejected(&self) -> bool {
        self.status == BackendStatus::KickedOut
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
    }

    pub fn eject(&mut self, retry_after: Instant) {
        self.status = BackendStatus::KickedOut;
        self.next_retry = Some(retry_after);
    }

    pub fn ready_for_retry(&self, now: Instant) -> bool {
        self.status == BackendStatus::KickedOut
            && self.next_retry.map(|t| now >= t).unwrap_or(false)
    }

    pub fn readmit(&mut self) {
        self.status = BackendStatus::Online;
        self.failure_count = 0;
        self.next_retry = None;
    }

    pub fn replace_address(&mut self, new_addr: SocketAddr) {
        self.addr = new_addr;
        self.status = BackendStatus::Replaced;
        self.failure_count = 0;
    }

    /// Picks the next read replica in round-robin order; `None` when the
    /// backend has no configured slaves (caller falls back to the primary).
    pub fn next_slave(&mut self) -> Option<SocketAddr> {
        if self.slaves.is_empty() {
            return None;
        }
        let addr = self.slaves[self.slave_cursor % self.slaves.len()];
        self.slave_cursor = self.slave_cursor.wrapping_add(1);
        Some(addr)
    }
}
