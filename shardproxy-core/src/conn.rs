//! Connections (§4.D): socket, read/write readiness, inbound/outbound
//! message queues, and the per-kind dispatch behavior described in the
//! spec's "Polymorphic connection callbacks" design note (§9) — realized
//! here as an enum match rather than a vtable, which is the idiomatic Rust
//! shape for a small closed set of connection kinds known at construction.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Token;

use crate::buffer::{Chain, ChunkPool};
use crate::message::Message;

/// Newtype over `mio::Token` used as the non-owning "weak reference" a
/// message holds back to its connection (§3 "owning connection pointer
/// (weak; non-owning)"). Tokens are stable for the lifetime of a connection
/// and never reused while it's open, so a message whose connection already
/// closed simply fails the `core.connections.get(id)` lookup instead of
/// dereferencing anything dangling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub Token);

impl From<Token> for ConnId {
    fn from(t: Token) -> Self {
        ConnId(t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Client,
    Server,
    Sentinel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

pub struct Connection {
    pub id: ConnId,
    pub kind: ConnKind,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub state: ConnState,

    /// Name of the server pool this connection belongs to (client: the pool
    /// whose listener accepted it; server/sentinel: the pool it forwards
    /// for).
    pub pool_name: String,

    /// Messages awaiting their turn to be written out this socket: client
    /// responses for a client connection, forwarded requests for a server
    /// connection.
    pub out_write_q: VecDeque<Message>,
    /// Bytes of the head-of-queue message already flushed, for partial
    /// `writev`s.
    pub write_cursor: usize,

    /// Server connections only: requests sent and awaiting a paired
    /// response, strict FIFO (§4.D).
    pub awaiting_reply: VecDeque<Message>,

    /// Partially parsed inbound message; `None` between messages.
    pub rmsg: Option<Message>,
    pub read_chain: Chain,

    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Client connections: number of requests received but not yet fully
    /// replied to (§5 "pipeline depth").
    pub pipeline_depth: usize,
    pub read_paused: bool,

    pub authenticated: bool,
    pub quit_requested: bool,
    pub eof: bool,

    /// Server connections only: set while an `AUTH` priming request is in
    /// flight; user requests queued behind it in `out_write_q` until it
    /// clears (§4.F).
    pub auth_pending: bool,

    /// Backend index this server connection belongs to, for failure
    /// accounting and ejection (§4.E/F).
    pub backend_index: Option<usize>,
    /// Whether this server connection addresses a read replica rather than
    /// the backend's primary (§4.F "Master-slave slave selection"). A
    /// slave connection's own failures are not folded into the shared
    /// backend's ejection accounting — a flaky read replica should not take
    /// writes to the primary down with it.
    pub is_slave: bool,

    pub connected_at: Instant,
}

impl Connection {
    pub fn new(
        id: ConnId,
        kind: ConnKind,
        stream: TcpStream,
        peer_addr: SocketAddr,
        pool_name: String,
        chunk_pool: ChunkPool,
    ) -> Connection {
        Connection {
            id,
            kind,
            stream,
            peer_addr,
            state: ConnState::Connected,
            pool_name,
            out_write_q: VecDeque::new(),
            write_cursor: 0,
            awaiting_reply: VecDeque::new(),
            rmsg: None,
            read_chain: Chain::new(chunk_pool),
            bytes_read: 0,
            bytes_written: 0,
            pipeline_depth: 0,
            read_paused: false,
            authenticated: false,
            quit_requested: false,
            eof: false,
            auth_pending: false,
            backend_index: None,
            is_slave: false,
            connected_at: Instant::now(),
        }
    }

    pub fn queue_outbound(&mut self, msg: Message) {
        self.out_write_q.push_back(msg);
    }

    pub fn has_pending_write(&self) -> bool {
        !self.out_write_q.is_empty()
    }

    pub fn is_client(&self) -> bool {
        self.kind == ConnKind::Client
    }
}
