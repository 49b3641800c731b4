//! The event loop (§4.K): binds every other component into one
//! single-threaded, non-blocking cycle — accept, read, parse, dispatch,
//! fragment, forward, pair, coalesce, write, and drain the timeout wheel.
//!
//! Grounded on the `mio`-driven main loop shape in
//! `examples/other_examples/0ecbfae8_jzwdsb-redis-rs__src-server.rs.rs`
//! (`collect_events` → `handle_reads`/`handle_writes`); see `DESIGN.md`.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::buffer::ChunkPool;
use crate::conn::{ConnId, ConnKind, ConnState, Connection};
use crate::error::{CoreError, CoreResult};
use crate::fragment;
use crate::hotset::HotSet;
use crate::message::{new_message, Command, Direction, FragState, Message, MessageExt};
use crate::parser::resp::{self, RespValue};
use crate::parser::ParseOutcome;
use crate::pool::ServerPool;
use crate::protocol::Wire;
use crate::sentinel::{SentinelClient, SentinelState, SwitchNotification};
use crate::stats::CoreStats;
use crate::timeout_wheel::TimeoutWheel;

/// Up to 128 outbound messages are flushed per `writev`-equivalent call
/// (§4.D "assemble an `iovec` of up to 128 entries"); `write_vectored` is the
/// idiomatic Rust realization of `writev` here.
const MAX_IOVECS_PER_WRITE: usize = 128;
const READ_CHUNK: usize = 64 * 1024;

/// Enables `SO_KEEPALIVE` and sets the idle time before the first probe on
/// an accepted client socket (§6 "client TCP keepalive seconds"). `mio`
/// exposes no keepalive API, so this drops to `libc` directly on the raw fd
/// — the same direct-syscall style `daemon.rs` uses for `fork`/`setsid`.
fn apply_keepalive(stream: &TcpStream, interval: Duration) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    let enable: libc::c_int = 1;
    // SAFETY: `fd` is a valid, open socket for the lifetime of this call;
    // `enable`/`secs` are plain stack values of the size `setsockopt` expects.
    unsafe {
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of_val(&enable) as libc::socklen_t,
        ) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
        let secs: libc::c_int = interval.as_secs().max(1) as libc::c_int;
        if libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            &secs as *const _ as *const libc::c_void,
            std::mem::size_of_val(&secs) as libc::socklen_t,
        ) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Listener bookkeeping: which pool a listening socket belongs to.
struct Listener {
    pool_name: String,
    listener: TcpListener,
}

/// Why a connection is being closed, distinguishing the synthetic error
/// text a server connection's in-flight requests are released with (§4.H,
/// §7) from a clean, already-replied-to planned close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    /// `QUIT`, or a quota-exceeded close, after the last reply has flushed.
    Clean,
    /// Socket error or unexpected EOF.
    Error,
    /// Per-request deadline expired (§4.H).
    Timeout,
}

/// Process-wide state the event loop owns and mutates (§9 "Global process
/// state"): no hidden globals, one `Core` handle threaded through explicitly.
pub struct Core {
    poll: Poll,
    events: Events,
    next_token: usize,

    listeners: HashMap<Token, Listener>,
    connections: HashMap<Token, Connection>,
    pools: HashMap<String, ServerPool>,
    /// Open server connections per (pool, backend index, read-only), up to
    /// `server_connections` deep; round-robin cursor spreads fragment
    /// fan-out load across them (§4.F). The `bool` keeps a backend's slave
    /// connections in a separate pool from its primary's, since a read
    /// command may be routed to a slave while writes always use the primary
    /// (§4.F "Master-slave slave selection").
    server_conns: HashMap<(String, usize, bool), Vec<ConnId>>,

    chunk_pool: ChunkPool,
    timeout_wheel: TimeoutWheel,
    pub stats: CoreStats,

    /// Shared behind `Arc` (not just the `ArcSwap` `HotSet` already wraps)
    /// so a background poller thread in the binary can hold its own clone
    /// and `publish` without any access to `Core` itself (§9 "Whitelist
    /// hot-swap", §10.4).
    pub whitelist: std::sync::Arc<HotSet<std::net::IpAddr>>,
    pub gray_list: std::sync::Arc<HotSet<String>>,
    pub broadcast_whitelist: std::sync::Arc<HotSet<String>>,

    sentinel_token: Option<Token>,
    sentinel_addr: Option<SocketAddr>,
    sentinel: SentinelClient,

    max_wait: Duration,
    pipeline_limit: usize,
    pipeline_resume_threshold: usize,
    quota_refill_interval: Duration,
    last_quota_refill: Instant,
    client_keepalive: Option<Duration>,

    shutdown: bool,
}

impl Core {
    pub fn new(
        chunk_size: usize,
        maxmemory_bytes: usize,
        pipeline_limit: usize,
        pipeline_resume_threshold: usize,
        quota_refill_interval: Duration,
        sentinel_reconnect_interval: Duration,
    ) -> CoreResult<Core> {
        Ok(Core {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            next_token: 1,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            pools: HashMap::new(),
            server_conns: HashMap::new(),
            chunk_pool: ChunkPool::new(chunk_size, maxmemory_bytes),
            timeout_wheel: TimeoutWheel::new(),
            stats: CoreStats::new(),
            whitelist: std::sync::Arc::new(HotSet::empty()),
            gray_list: std::sync::Arc::new(HotSet::empty()),
            broadcast_whitelist: std::sync::Arc::new(HotSet::empty()),
            sentinel_token: None,
            sentinel_addr: None,
            sentinel: SentinelClient::new(sentinel_reconnect_interval),
            max_wait: Duration::from_millis(1000),
            pipeline_limit,
            pipeline_resume_threshold,
            quota_refill_interval,
            last_quota_refill: Instant::now(),
            client_keepalive: None,
            shutdown: false,
        })
    }

    /// Sets the `SO_KEEPALIVE`/`TCP_KEEPIDLE` applied to every accepted
    /// client socket (§6 "client TCP keepalive seconds"). `None` leaves the
    /// OS default in place.
    pub fn set_client_keepalive(&mut self, interval: Option<Duration>) {
        self.client_keepalive = interval;
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    pub fn add_pool(&mut self, pool: ServerPool) -> CoreResult<()> {
        let name = pool.config.name.clone();
        let listen = pool.config.listen;
        let mut listener = TcpListener::bind(listen)?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;
        self.listeners.insert(
            token,
            Listener {
                pool_name: name.clone(),
                listener,
            },
        );
        self.pools.insert(name, pool);
        Ok(())
    }

    pub fn configure_sentinel(&mut self, addr: SocketAddr) {
        self.sentinel_addr = Some(addr);
    }

    /// The actual bound address for a pool's listener — useful when
    /// `listen` was configured with port `0` and the OS assigned one, and
    /// for tests that need to connect a client without hardcoding a port.
    pub fn listener_addr(&self, pool_name: &str) -> Option<SocketAddr> {
        self.listeners
            .values()
            .find(|l| l.pool_name == pool_name)
            .and_then(|l| l.listener.local_addr().ok())
    }

    /// Runs until `shutdown()` is called (or forever, for a production
    /// process). Exposed as a loop over `tick` so tests can drive individual
    /// iterations deterministically.
    pub fn run(&mut self) -> CoreResult<()> {
        while !self.shutdown {
            self.tick()?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.shutdown = true;
    }

    /// One readiness cycle plus time-wheel drain (§4.K).
    pub fn tick(&mut self) -> CoreResult<()> {
        let now = Instant::now();
        if self.sentinel_token.is_none() {
            self.maybe_connect_sentinel(now);
        }

        let timeout = self.next_wait(now);
        self.poll.poll(&mut self.events, Some(timeout))?;

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if let Some(listener_pool) = self.listeners.get(&token).map(|l| l.pool_name.clone()) {
                if readable {
                    self.accept_loop(token, &listener_pool);
                }
                continue;
            }
            if Some(token) == self.sentinel_token {
                if readable {
                    self.sentinel_readable(token);
                }
                if writable {
                    self.flush_writes(token);
                }
                continue;
            }
            if readable {
                self.conn_readable(token);
            }
            if writable {
                self.flush_writes(token);
            }
        }

        self.drain_timeouts(now);
        self.drain_quota_refill(now);
        self.drain_ejection_retries(now);
        self.drain_backpressure_resume();
        Ok(())
    }

    fn next_wait(&self, now: Instant) -> Duration {
        let deadline_wait = self
            .timeout_wheel
            .earliest_deadline()
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or(self.max_wait);
        deadline_wait.min(self.max_wait)
    }

    // ---------------------------------------------------------------- accept

    fn accept_loop(&mut self, listener_token: Token, pool_name: &str) {
        loop {
            let accepted = {
                let listener = &self.listeners.get(&listener_token).unwrap().listener;
                listener.accept()
            };
            match accepted {
                Ok((mut stream, addr)) => {
                    if !self.whitelist.load().is_empty() && !self.whitelist.contains(&addr.ip()) {
                        debug!(%addr, "rejecting client outside IP whitelist");
                        continue;
                    }
                    let token = self.alloc_token();
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(%err, "failed to register accepted client socket");
                        continue;
                    }
                    if let Some(interval) = self.client_keepalive {
                        if let Err(err) = apply_keepalive(&stream, interval) {
                            warn!(%addr, %err, "failed to set client keepalive");
                        }
                    }
                    let conn = Connection::new(
                        ConnId(token),
                        ConnKind::Client,
                        stream,
                        addr,
                        pool_name.to_string(),
                        self.chunk_pool.clone(),
                    );
                    self.stats
                        .connections_accepted
                        .with_label_values(&["client"])
                        .inc();
                    self.connections.insert(token, conn);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "accept() failed");
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------ read path

    fn conn_readable(&mut self, token: Token) {
        let kind = match self.connections.get(&token) {
            Some(c) => c.kind,
            None => return,
        };
        loop {
            let mut buf = [0u8; READ_CHUNK];
            let read_result = {
                let conn = self.connections.get_mut(&token).unwrap();
                conn.stream.read(&mut buf)
            };
            match read_result {
                Ok(0) => {
                    self.close_connection(token, CloseKind::Error);
                    return;
                }
                Ok(n) => {
                    {
                        let conn = self.connections.get_mut(&token).unwrap();
                        conn.read_chain.append_bytes(&buf[..n]);
                        conn.bytes_read += n as u64;
                    }
                    match kind {
                        ConnKind::Client => {
                            if let Err(err) = self.drain_client_requests(token) {
                                debug!(%err, "closing client after parse error");
                                self.fail_connection(token, err);
                                return;
                            }
                        }
                        ConnKind::Server => {
                            if let Err(err) = self.drain_server_responses(token) {
                                debug!(%err, "closing server connection after parse error");
                                self.fail_connection(token, err);
                                return;
                            }
                        }
                        ConnKind::Sentinel => unreachable!("sentinel handled separately"),
                    }
                    if n < READ_CHUNK {
                        // Likely drained the socket for this readiness event;
                        // a short read still re-arms naturally on next
                        // edgeless (level-triggered) readiness if more is
                        // buffered in the kernel.
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.fail_connection(token, CoreError::Io(err));
                    return;
                }
            }
        }
        self.maybe_pause_read(token);
    }

    /// Repeatedly parses complete requests out of a client's read chain,
    /// dispatching each (§4.D read path steps 2-4).
    fn drain_client_requests(&mut self, token: Token) -> CoreResult<()> {
        loop {
            let wire = self.wire_for(token);
            let bytes = {
                let conn = self.connections.get(&token).unwrap();
                conn.read_chain.to_contiguous()
            };
            let outcome = wire.parse_request(&bytes)?;
            match outcome {
                ParseOutcome::Again => return Ok(()),
                ParseOutcome::Complete(parsed, consumed) => {
                    let conn = self.connections.get_mut(&token).unwrap();
                    let mut msg_chain = conn.read_chain.split(consumed);
                    std::mem::swap(&mut conn.read_chain, &mut msg_chain);
                    // `msg_chain` now holds exactly the consumed message's
                    // bytes; `conn.read_chain` keeps the surplus, per §4.D
                    // step 3 ("split the chain to separate any surplus").
                    let msg = new_message(Direction::Request, msg_chain);
                    {
                        let mut state = msg.borrow_mut();
                        state.command = Some(parsed.command);
                        state.keys = parsed.keys;
                        state.owner = Some(ConnId(token));
                    }
                    self.dispatch_client_request(token, msg)?;
                }
            }
        }
    }

    fn wire_for(&self, token: Token) -> Wire {
        let conn = &self.connections[&token];
        self.pools
            .get(&conn.pool_name)
            .map(|p| p.config.wire)
            .unwrap_or(Wire::Resp)
    }

    // --------------------------------------------------------- dispatch req

    /// `req_recv_done` (§4.D): filters, AUTH, quota, then either a single
    /// forward or a fragmented fan-out.
    fn dispatch_client_request(&mut self, token: Token, msg: Message) -> CoreResult<()> {
        let command = msg.borrow().command.clone().unwrap_or(Command::Other(String::new()));

        // Empty inline line: drop silently.
        if matches!(&command, Command::Other(s) if s.is_empty()) && msg.borrow().keys.is_empty() {
            return Ok(());
        }

        if command == Command::Quit {
            let conn = self.connections.get_mut(&token).unwrap();
            conn.quit_requested = true;
            conn.eof = true;
            if !conn.has_pending_write() {
                self.close_connection(token, CloseKind::Clean);
            }
            return Ok(());
        }

        if command == Command::Ping {
            self.reply_locally(token, msg, RespValue::Simple(b"PONG".to_vec()));
            return Ok(());
        }

        let pool_name = self.connections[&token].pool_name.clone();

        if command == Command::Auth {
            let secret = msg.borrow().keys.first().map(|k| k.value.clone());
            let expected = self.pools.get(&pool_name).and_then(|p| p.config.client_auth.clone());
            let ok = match (&expected, &secret) {
                (None, _) => true,
                (Some(expected), Some(given)) => expected.as_bytes() == given.as_slice(),
                _ => false,
            };
            let conn = self.connections.get_mut(&token).unwrap();
            conn.authenticated = ok;
            let reply = if ok {
                RespValue::ok()
            } else {
                RespValue::error("ERR invalid password")
            };
            self.reply_locally(token, msg, reply);
            return Ok(());
        }

        // Permission / gray-list filter (§4.D step 1). "Unauthorized
        // permission" is realized as the AUTH gate below: a pool configured
        // with `client_auth` refuses every command from an unauthenticated
        // connection, incrementing the forbidden-commands counter rather
        // than just NOAUTH-replying silently (see DESIGN.md open question).
        let Some(pool) = self.pools.get(&pool_name) else {
            self.reply_locally(token, msg, RespValue::error("ERR unknown pool"));
            return Ok(());
        };
        if pool.config.client_auth.is_some() && !self.connections[&token].authenticated {
            self.stats.forbidden_commands.with_label_values(&[&pool_name]).inc();
            self.reply_locally(token, msg, RespValue::error("NOAUTH Authentication required"));
            return Ok(());
        }
        if self.gray_list.contains(command.name()) {
            warn!(pool = %pool_name, command = %command.name(), "gray-listed command forwarded");
        }
        let broadcast_whitelist_active = !self.broadcast_whitelist.load().is_empty();
        if command == Command::Broadcast
            && broadcast_whitelist_active
            && !self.broadcast_whitelist.contains(command.name())
        {
            self.stats.forbidden_commands.with_label_values(&[&pool_name]).inc();
            self.reply_locally(token, msg, RespValue::error("ERR BROADCAST not permitted"));
            return Ok(());
        }

        // Quota gate (§4.J).
        let pool = self.pools.get_mut(&pool_name).unwrap();
        if matches!(pool.quota_gate.admit(), crate::quota::Admission::Rejected) {
            self.stats.quota_rejections.with_label_values(&[&pool_name]).inc();
            self.reply_locally(token, msg, RespValue::error("ERR quota exceeded"));
            let conn = self.connections.get_mut(&token).unwrap();
            conn.quit_requested = true;
            // §7 "Quota exceeded ... connection closed": schedule the close
            // the same way `QUIT` does, once the error reply has flushed.
            conn.eof = true;
            return Ok(());
        }
        {
            let mut state = msg.borrow_mut();
            state.flags.ticket = true;
            state.quota_pool = Some(pool_name.clone());
        }

        self.route_and_forward(token, msg, &pool_name)
    }

    fn reply_locally(&mut self, token: Token, msg: Message, reply: RespValue) {
        msg.borrow_mut().reply_override = Some(reply.to_bytes());
        msg.mark_done();
        let conn = self.connections.get_mut(&token).unwrap();
        conn.queue_outbound(msg);
        self.arm_writable(token);
    }

    /// Routes `msg` to one or more backends: a single forward for ordinary
    /// commands, or a fragmented fan-out for multi-key/`BROADCAST` commands
    /// (§4.D step 4-6, §4.G).
    fn route_and_forward(&mut self, token: Token, msg: Message, pool_name: &str) -> CoreResult<()> {
        let command = msg.borrow().command.clone().unwrap();
        let live_count = self.pools[pool_name].live_backend_count();
        if live_count == 0 {
            self.reply_locally(token, msg, RespValue::error("ERR no live backend"));
            return Ok(());
        }

        // BROADCAST enumerates every backend rather than selecting one by
        // key, so slave read-routing (which picks one physical server per
        // shard) doesn't apply to it; it always addresses primaries.
        if command == Command::Broadcast {
            let raw = msg.borrow().chain.to_contiguous();
            let fragments = fragment::fragment_broadcast(&raw, live_count);
            return self.install_fragments(token, msg, pool_name, fragments, None, false);
        }

        // Write commands always go to the primary; read commands may be
        // routed to a configured slave (§4.F "Master-slave slave selection").
        let read_only = command.permission() == crate::protocol::Permission::Read;

        if command.is_multi_key() {
            let keys = msg.borrow().keys.clone();
            let pool = &self.pools[pool_name];
            let fragments =
                fragment::fragment_multi_key(&command, &keys, |k| pool.route(k).unwrap_or(0));
            if fragments.len() <= 1 {
                // Touches exactly one shard: forward the original bytes
                // unmodified instead of re-encoding a single-fragment copy.
                let backend = fragments
                    .first()
                    .map(|f| f.backend_index)
                    .unwrap_or(0);
                return self.forward_single(token, msg, pool_name, backend, read_only);
            }
            return self.install_fragments(token, msg, pool_name, fragments, Some(keys.len()), read_only);
        }

        // Ordinary single-key (or keyless) command: route on the first key
        // if present, otherwise deterministically on the raw command bytes
        // (EVAL and friends — an Open Question the spec leaves unresolved
        // for keyless routing; see DESIGN.md).
        let key = msg.borrow().keys.first().map(|k| k.value.clone());
        let pool = &self.pools[pool_name];
        let backend = match key {
            Some(k) => pool.route(&k).unwrap_or(0),
            None => {
                let raw = msg.borrow().chain.to_contiguous();
                pool.route(&raw).unwrap_or(0)
            }
        };
        self.forward_single(token, msg, pool_name, backend, read_only)
    }

    /// Forwards `msg` verbatim (no fragmentation) to `backend` and places it
    /// on the client's outbound queue, `done = false`, awaiting the paired
    /// response.
    fn forward_single(
        &mut self,
        token: Token,
        msg: Message,
        pool_name: &str,
        backend: usize,
        read_only: bool,
    ) -> CoreResult<()> {
        {
            let conn = self.connections.get_mut(&token).unwrap();
            conn.pipeline_depth += 1;
            conn.queue_outbound(msg.clone());
        }
        self.send_to_backend(pool_name, backend, msg.clone(), read_only)?;
        Ok(())
    }

    /// Splits `msg` into fragment children, installs the (not-yet-done)
    /// parent on the client's outbound queue, and forwards each child
    /// (§4.D step 5, §4.G steps 2-4).
    fn install_fragments(
        &mut self,
        token: Token,
        msg: Message,
        pool_name: &str,
        fragments: Vec<fragment::Fragment>,
        total_keys: Option<usize>,
        read_only: bool,
    ) -> CoreResult<()> {
        let nfrag = fragments.len();
        let key_indices: Vec<Vec<usize>> = fragments.iter().map(|f| f.key_indices.clone()).collect();
        {
            let mut state = msg.borrow_mut();
            state.frag = Some(FragState {
                frag_id: state.id.0,
                nfrag,
                nfrag_done: 0,
                ferror: false,
                key_indices,
            });
            state.fragment_replies = vec![None; nfrag];
        }
        let _ = total_keys;
        {
            let conn = self.connections.get_mut(&token).unwrap();
            conn.pipeline_depth += 1;
            conn.queue_outbound(msg.clone());
        }
        self.stats
            .fragments_dispatched
            .with_label_values(&[pool_name, msg.borrow().command.as_ref().unwrap().name()])
            .inc_by(nfrag as u64);

        for (slot, fragment) in fragments.into_iter().enumerate() {
            let chain = {
                let mut chain = crate::buffer::Chain::new(self.chunk_pool.clone());
                chain.append_bytes(&fragment.request_bytes);
                chain
            };
            let child = new_message(Direction::Request, chain);
            {
                let mut child_state = child.borrow_mut();
                child_state.frag_owner = std::rc::Rc::downgrade(&msg);
                child_state.frag_slot = Some(slot);
                child_state.command = msg.borrow().command.clone();
            }
            self.send_to_backend(pool_name, fragment.backend_index, child, read_only)?;
        }
        Ok(())
    }

    /// Hands `req` to a (possibly newly-connected) server connection for
    /// `backend` in `pool_name`, arming writability and the timeout wheel
    /// (§4.F, §4.H). `read_only` selects a slave connection pool when the
    /// backend has configured slaves; writes always use the primary pool.
    fn send_to_backend(
        &mut self,
        pool_name: &str,
        backend: usize,
        req: Message,
        read_only: bool,
    ) -> CoreResult<()> {
        let conn_id = self.server_conn_for(pool_name, backend, read_only)?;
        let timeout = self.pools[pool_name].config.timeout;
        let deadline = Instant::now() + timeout;
        {
            let mut state = req.borrow_mut();
            state.deadline = Some(deadline);
        }
        self.timeout_wheel.insert(deadline, req.borrow().id, conn_id);
        let token = conn_id.0;
        let conn = self.connections.get_mut(&token).unwrap();
        conn.awaiting_reply.push_back(req.clone());
        conn.queue_outbound(req);
        self.arm_writable(token);
        Ok(())
    }

    /// Round-robins across up to `server_connections` live connections per
    /// backend, connecting a fresh one (primed with `AUTH` if configured) the
    /// first time a backend is touched (§4.F). `read_only` connections to a
    /// backend with configured slaves address the next slave in round-robin
    /// order instead of the primary, and are pooled separately so a slave
    /// connection is never reused for a write.
    fn server_conn_for(&mut self, pool_name: &str, backend: usize, read_only: bool) -> CoreResult<ConnId> {
        let has_slaves = !self.pools[pool_name].backends[backend].slaves.is_empty();
        let use_slave = read_only && has_slaves;
        let key = (pool_name.to_string(), backend, use_slave);
        let depth = self.pools[pool_name].config.server_connections;
        let live: Vec<ConnId> = self
            .server_conns
            .get(&key)
            .into_iter()
            .flatten()
            .copied()
            .filter(|c| self.connections.contains_key(&c.0))
            .collect();

        if live.len() < depth {
            let addr = if use_slave {
                self.pools
                    .get_mut(pool_name)
                    .unwrap()
                    .backends[backend]
                    .next_slave()
                    .expect("has_slaves checked above")
            } else {
                self.pools[pool_name].backends[backend].addr
            };
            let conn_id = self.connect_server(pool_name, backend, addr, use_slave)?;
            self.server_conns.entry(key).or_default().push(conn_id);
            return Ok(conn_id);
        }

        // least-loaded of the live set, by pending in-queue length.
        let chosen = live
            .iter()
            .min_by_key(|c| self.connections[&c.0].out_write_q.len())
            .copied()
            .unwrap();
        Ok(chosen)
    }

    fn connect_server(
        &mut self,
        pool_name: &str,
        backend: usize,
        addr: SocketAddr,
        is_slave: bool,
    ) -> CoreResult<ConnId> {
        let mut stream = TcpStream::connect(addr)?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        let mut conn = Connection::new(
            ConnId(token),
            ConnKind::Server,
            stream,
            addr,
            pool_name.to_string(),
            self.chunk_pool.clone(),
        );
        conn.backend_index = Some(backend);
        conn.is_slave = is_slave;
        conn.state = ConnState::Connecting;

        if let Some(password) = self.pools[pool_name].config.password.clone() {
            conn.auth_pending = true;
            let mut auth_chain = crate::buffer::Chain::new(self.chunk_pool.clone());
            auth_chain.append_bytes(&resp::encode_multibulk("AUTH", [password.as_bytes()]));
            let auth_msg = new_message(Direction::Request, auth_chain);
            auth_msg.borrow_mut().flags.noreply = true;
            auth_msg.borrow_mut().flags.swallow = true;
            conn.awaiting_reply.push_back(auth_msg.clone());
            conn.queue_outbound(auth_msg);
        }

        self.stats.connections_accepted.with_label_values(&["server"]).inc();
        self.connections.insert(token, conn);
        Ok(ConnId(token))
    }

    // --------------------------------------------------------- read: server

    /// Parses and pairs server responses, strict FIFO against
    /// `awaiting_reply` (§4.D "server connections ... `recv_done`").
    fn drain_server_responses(&mut self, token: Token) -> CoreResult<()> {
        loop {
            let bytes = {
                let conn = self.connections.get(&token).unwrap();
                conn.read_chain.to_contiguous()
            };
            match resp::parse_response(&bytes)? {
                ParseOutcome::Again => return Ok(()),
                ParseOutcome::Complete(value, consumed) => {
                    {
                        let conn = self.connections.get_mut(&token).unwrap();
                        conn.read_chain.consume(consumed);
                    }
                    self.pair_server_response(token, value)?;
                }
            }
        }
    }

    fn pair_server_response(&mut self, token: Token, value: RespValue) -> CoreResult<()> {
        let req = {
            let conn = self.connections.get_mut(&token).unwrap();
            conn.awaiting_reply.pop_front()
        };
        let Some(req) = req else {
            warn!("response with no outstanding request on server connection");
            return Ok(());
        };

        if let Some(deadline) = req.borrow().deadline {
            self.timeout_wheel.remove(deadline, req.borrow().id);
        }

        if req.borrow().flags.swallow {
            // AUTH priming reply: consumed silently, unblocks queued
            // user requests behind it (§4.F).
            let conn = self.connections.get_mut(&token).unwrap();
            conn.auth_pending = false;
            if value.is_error() {
                warn!(addr = %conn.peer_addr, "backend AUTH rejected");
            }
            return Ok(());
        }

        let backend_index = self.connections[&token].backend_index;
        let is_slave = self.connections[&token].is_slave;
        let pool_name_conn = self.connections[&token].pool_name.clone();
        if !is_slave {
            if let Some(idx) = backend_index {
                if let Some(pool) = self.pools.get_mut(&pool_name_conn) {
                    pool.record_success(idx);
                }
            }
        }

        let parent = req.borrow().frag_owner.upgrade();
        if let Some(parent) = parent {
            self.complete_fragment_child(token, req, parent, value)?;
        } else {
            self.complete_single(token, req, value)?;
        }
        Ok(())
    }

    fn complete_single(&mut self, _server_token: Token, req: Message, value: RespValue) -> CoreResult<()> {
        let client_token = req.borrow().owner.map(|c| c.0);
        req.borrow_mut().reply_override = Some(value.to_bytes());
        req.mark_done();
        self.release_ticket(&req);
        if let Some(client_token) = client_token {
            if let Some(conn) = self.connections.get_mut(&client_token) {
                conn.pipeline_depth = conn.pipeline_depth.saturating_sub(1);
            }
            self.arm_writable(client_token);
        }
        Ok(())
    }

    /// Returns `req`'s consumed quota token to its pool once the request is
    /// fully retired (§4.J "On `req_put`, if the message's `ticket` is set
    /// ... the token is returned"). Only the top-level client-facing
    /// message ever carries `ticket = true` (fragment children don't), so
    /// this is called once per client request regardless of fan-out. Looks
    /// the pool up from the message's own `quota_pool` rather than the
    /// owning connection, so the token is still returned even if the client
    /// already disconnected before the backend replied.
    fn release_ticket(&mut self, req: &Message) {
        if !req.borrow().flags.ticket {
            return;
        }
        req.borrow_mut().flags.ticket = false;
        let Some(pool_name) = req.borrow().quota_pool.clone() else {
            return;
        };
        if let Some(pool) = self.pools.get(&pool_name) {
            pool.quota_gate.release();
        }
    }

    fn complete_fragment_child(
        &mut self,
        _server_token: Token,
        child: Message,
        parent: Message,
        value: RespValue,
    ) -> CoreResult<()> {
        let is_err = value.is_error();
        let mut parent_done = false;
        let mut parent_command = Command::Other(String::new());
        let mut total_keys = 0usize;
        let slot = child.borrow().frag_slot.unwrap_or(0);
        {
            let mut parent_state = parent.borrow_mut();
            parent_command = parent_state.command.clone().unwrap_or(parent_command);
            total_keys = parent_state.keys.len();
            if slot < parent_state.fragment_replies.len() {
                parent_state.fragment_replies[slot] = Some(value.to_bytes());
            }
            if let Some(frag) = parent_state.frag.as_mut() {
                frag.nfrag_done += 1;
                if is_err {
                    frag.ferror = true;
                }
                parent_done = frag.nfrag_done >= frag.nfrag;
            }
        }
        if parent_done {
            let replies: Vec<RespValue> = {
                let state = parent.borrow();
                state
                    .fragment_replies
                    .iter()
                    .map(|b| {
                        b.as_ref()
                            .and_then(|bytes| match resp::parse_response(bytes) {
                                Ok(ParseOutcome::Complete(v, _)) => Some(v),
                                _ => None,
                            })
                            .unwrap_or_else(|| RespValue::error("ERR fragment response missing"))
                    })
                    .collect()
            };
            let key_indices: Vec<Vec<usize>> = parent
                .borrow()
                .frag
                .as_ref()
                .map(|f| f.key_indices.clone())
                .unwrap_or_default();
            let coalesced = fragment::coalesce(&parent_command, &replies, &key_indices, total_keys);
            parent.borrow_mut().reply_override = Some(coalesced.to_bytes());
            parent.mark_done();
            self.release_ticket(&parent);
            if let Some(client_token) = parent.borrow().owner.map(|c| c.0) {
                if let Some(conn) = self.connections.get_mut(&client_token) {
                    conn.pipeline_depth = conn.pipeline_depth.saturating_sub(1);
                }
                self.arm_writable(client_token);
            }
        }
        Ok(())
    }

    // ----------------------------------------------------------- write path

    fn arm_writable(&mut self, token: Token) {
        if let Some(conn) = self.connections.get_mut(&token) {
            let interest = Interest::READABLE | Interest::WRITABLE;
            let _ = self.poll.registry().reregister(&mut conn.stream, token, interest);
        }
    }

    fn disarm_writable(&mut self, token: Token) {
        if let Some(conn) = self.connections.get_mut(&token) {
            let _ = self
                .poll
                .registry()
                .reregister(&mut conn.stream, token, Interest::READABLE);
        }
    }

    /// Drains as many *ready* (done, for client queues) messages from the
    /// head of `token`'s outbound queue as fit in one `write_vectored` call
    /// (§4.D write path).
    fn flush_writes(&mut self, token: Token) {
        loop {
            let is_client = match self.connections.get(&token) {
                Some(c) => c.is_client(),
                None => return,
            };

            let mut slices: Vec<Vec<u8>> = Vec::new();
            {
                let conn = self.connections.get(&token).unwrap();
                for msg in conn.out_write_q.iter().take(MAX_IOVECS_PER_WRITE) {
                    if is_client && !msg.is_done() {
                        break;
                    }
                    slices.push(outbound_bytes(msg));
                }
            }
            if slices.is_empty() {
                break;
            }

            let mut joined = Vec::new();
            for s in &slices {
                joined.extend_from_slice(s);
            }
            let cursor = self.connections[&token].write_cursor;
            let to_write = &joined[cursor.min(joined.len())..];

            let write_result = {
                let conn = self.connections.get_mut(&token).unwrap();
                conn.stream.write(to_write)
            };
            match write_result {
                Ok(0) => break,
                Ok(n) => {
                    let conn = self.connections.get_mut(&token).unwrap();
                    conn.bytes_written += n as u64;
                    conn.write_cursor += n;
                    let mut remaining = conn.write_cursor;
                    while let Some(front) = conn.out_write_q.front() {
                        let front_len = outbound_bytes(front).len();
                        if !is_client || front.is_done() {
                            if remaining >= front_len {
                                remaining -= front_len;
                                conn.out_write_q.pop_front();
                            } else {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                    conn.write_cursor = remaining;
                    if n < to_write.len() {
                        break; // partial write; re-arm for next readiness
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.fail_connection(token, CoreError::Io(err));
                    return;
                }
            }
        }

        let (queue_empty, drained, is_eof) = match self.connections.get(&token) {
            Some(conn) => {
                let queue_empty = conn.out_write_q.is_empty();
                let stalled_on_undone_head = conn.is_client()
                    && conn.out_write_q.front().map(|m| !m.is_done()).unwrap_or(false);
                (queue_empty, queue_empty || stalled_on_undone_head, conn.eof)
            }
            None => return,
        };
        if drained {
            self.disarm_writable(token);
        }
        if queue_empty && is_eof {
            self.close_connection(token, CloseKind::Clean);
        }
    }

    // ------------------------------------------------------------ timeouts

    fn drain_timeouts(&mut self, now: Instant) {
        let expired = self.timeout_wheel.drain_expired(now);
        for entry in expired {
            let token = entry.conn_id.0;
            debug!(?token, "request timed out, closing server connection");
            self.close_connection(token, CloseKind::Timeout);
        }
    }

    fn drain_quota_refill(&mut self, now: Instant) {
        if now.duration_since(self.last_quota_refill) >= self.quota_refill_interval {
            for pool in self.pools.values() {
                pool.quota_gate.refill();
                self.stats
                    .pool_token_level
                    .with_label_values(&[&pool.config.name])
                    .set(pool.quota_gate.tokens_remaining() as i64);
            }
            self.last_quota_refill = now;
        }
    }

    fn drain_ejection_retries(&mut self, now: Instant) {
        for pool in self.pools.values_mut() {
            pool.retry_ejected(now);
        }
    }

    fn drain_backpressure_resume(&mut self) {
        let budget = self.chunk_pool.budget();
        if budget.over_limit() {
            return;
        }
        let to_resume: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.read_paused && c.pipeline_depth < self.pipeline_resume_threshold)
            .map(|(t, _)| *t)
            .collect();
        for token in to_resume {
            if let Some(conn) = self.connections.get_mut(&token) {
                conn.read_paused = false;
                let _ = self
                    .poll
                    .registry()
                    .reregister(&mut conn.stream, token, Interest::READABLE | Interest::WRITABLE);
            }
        }
    }

    fn maybe_pause_read(&mut self, token: Token) {
        let budget = self.chunk_pool.budget();
        if !budget.over_limit() {
            return;
        }
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if conn.is_client() && conn.pipeline_depth >= self.pipeline_limit && !conn.read_paused {
            conn.read_paused = true;
            let _ = self.poll.registry().reregister(&mut conn.stream, token, Interest::WRITABLE);
        }
    }

    // --------------------------------------------------------------- close

    fn fail_connection(&mut self, token: Token, err: CoreError) {
        debug!(?token, %err, "connection failed");
        self.close_connection(token, CloseKind::Error);
    }

    /// Closes `token`, synthesizing error replies for every in-flight
    /// request that expected one (§4.D "Failure policy", §7). `reason`
    /// distinguishes a deadline expiry (§4.H, `-ERR timeout`) from an
    /// ordinary I/O failure (`-ERR backend connection error`) and from a
    /// clean planned close (`QUIT`/quota-close after the reply flushes),
    /// which carries no synthetic reply text at all.
    fn close_connection(&mut self, token: Token, reason: CloseKind) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut conn.stream);

        let role = match conn.kind {
            ConnKind::Client => "client",
            ConnKind::Server => "server",
            ConnKind::Sentinel => "sentinel",
        };
        self.stats.connections_closed.with_label_values(&[role]).inc();

        if conn.kind == ConnKind::Server {
            if let (Some(idx), false) = (conn.backend_index, conn.is_slave) {
                if let Some(pool) = self.pools.get_mut(&conn.pool_name) {
                    pool.record_failure(idx, Instant::now());
                    if pool.backends[idx].is_ejected() {
                        self.stats
                            .backend_ejections
                            .with_label_values(&[&conn.pool_name, &pool.backends[idx].name])
                            .inc();
                    }
                }
            }
            self.server_conns
                .values_mut()
                .for_each(|v| v.retain(|c| c.0 != token));

            let error_text = match reason {
                CloseKind::Timeout => "ERR timeout",
                CloseKind::Error | CloseKind::Clean => "ERR backend connection error",
            };
            // Every request still queued for write is also still sitting in
            // `awaiting_reply` (both are populated together in
            // `send_to_backend`, and a write-queue entry is only popped once
            // fully flushed) — draining `awaiting_reply` alone covers both
            // without releasing the same message twice.
            while let Some(req) = conn.awaiting_reply.pop_front() {
                self.release_failed_request(req, error_text);
            }
            conn.out_write_q.clear();
        } else if conn.kind == ConnKind::Client {
            // Requests already forwarded stay on their server's awaiting_reply
            // queue; their eventual response simply finds a vanished client
            // and is dropped when written (connections map lookup fails).
        } else {
            self.sentinel_token = None;
            self.sentinel.on_disconnected(Instant::now());
        }
    }

    fn release_failed_request(&mut self, req: Message, reason: &str) {
        if req.borrow().flags.swallow {
            return;
        }
        if let Some(deadline) = req.borrow().deadline {
            self.timeout_wheel.remove(deadline, req.borrow().id);
        }
        let parent = req.borrow().frag_owner.upgrade();
        if let Some(parent) = parent {
            let _ = self.complete_fragment_child(
                Token(0),
                req,
                parent,
                RespValue::error(reason),
            );
            return;
        }
        if req.borrow().flags.noreply {
            return;
        }
        let client_token = req.borrow().owner.map(|c| c.0);
        req.borrow_mut().reply_override = Some(RespValue::error(reason).to_bytes());
        req.mark_done();
        self.release_ticket(&req);
        if let Some(client_token) = client_token {
            if let Some(conn) = self.connections.get_mut(&client_token) {
                conn.pipeline_depth = conn.pipeline_depth.saturating_sub(1);
            }
            self.arm_writable(client_token);
        }
    }

    // ------------------------------------------------------------ sentinel

    fn maybe_connect_sentinel(&mut self, now: Instant) {
        let Some(addr) = self.sentinel_addr else {
            return;
        };
        if self.sentinel.state != SentinelState::Disconnected {
            return;
        }
        if self.sentinel.next_reconnect_at.is_some() && !self.sentinel.should_reconnect(now) {
            return;
        }
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let token = self.alloc_token();
                if self
                    .poll
                    .registry()
                    .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                    .is_err()
                {
                    return;
                }
                let mut conn = Connection::new(
                    ConnId(token),
                    ConnKind::Sentinel,
                    stream,
                    addr,
                    String::new(),
                    self.chunk_pool.clone(),
                );
                for cmd in SentinelClient::handshake_commands() {
                    let mut chain = crate::buffer::Chain::new(self.chunk_pool.clone());
                    chain.append_bytes(&cmd);
                    let msg = new_message(Direction::Request, chain);
                    msg.borrow_mut().flags.noreply = true;
                    conn.queue_outbound(msg);
                }
                self.connections.insert(token, conn);
                self.sentinel_token = Some(token);
                self.sentinel.on_connected();
                self.sentinel.advance(SentinelState::Steady);
                self.arm_writable(token);
            }
            Err(err) => {
                warn!(%err, "sentinel connect failed");
                self.sentinel.on_disconnected(now);
            }
        }
    }

    fn sentinel_readable(&mut self, token: Token) {
        loop {
            let mut buf = [0u8; READ_CHUNK];
            let n = {
                let conn = self.connections.get_mut(&token).unwrap();
                conn.stream.read(&mut buf)
            };
            match n {
                Ok(0) => {
                    self.close_connection(token, CloseKind::Error);
                    return;
                }
                Ok(n) => {
                    let conn = self.connections.get_mut(&token).unwrap();
                    conn.read_chain.append_bytes(&buf[..n]);
                    if let Err(err) = self.drain_sentinel_messages(token) {
                        warn!(%err, "sentinel protocol error");
                        self.close_connection(token, CloseKind::Error);
                        return;
                    }
                    if n < READ_CHUNK {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "sentinel read error");
                    self.close_connection(token, CloseKind::Error);
                    return;
                }
            }
        }
    }

    fn drain_sentinel_messages(&mut self, token: Token) -> CoreResult<()> {
        loop {
            let bytes = {
                let conn = self.connections.get(&token).unwrap();
                conn.read_chain.to_contiguous()
            };
            match resp::parse_response(&bytes)? {
                ParseOutcome::Again => return Ok(()),
                ParseOutcome::Complete(value, consumed) => {
                    let conn = self.connections.get_mut(&token).unwrap();
                    conn.read_chain.consume(consumed);
                    if let RespValue::Array(Some(items)) = &value {
                        if items.len() == 3 {
                            if let (RespValue::Bulk(Some(kind)), RespValue::Bulk(_), RespValue::Bulk(Some(payload))) =
                                (&items[0], &items[1], &items[2])
                            {
                                if kind.as_slice() == b"message" {
                                    if let Ok(text) = std::str::from_utf8(payload) {
                                        if let Some(notification) = crate::sentinel::parse_switch_message(text) {
                                            self.apply_switch_notification(notification);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Applies a `+switch-master`/`+redirect-to-master` notification: swaps
    /// the backend's address and closes every existing connection to the
    /// old address, which cascades synthetic errors upstream (§4.I).
    fn apply_switch_notification(&mut self, notification: SwitchNotification) {
        info!(
            pool = %notification.pool,
            backend = %notification.backend_name,
            old = %notification.old_addr,
            new = %notification.new_addr,
            "sentinel master switch"
        );
        let Some(pool) = self.pools.get_mut(&notification.pool) else {
            return;
        };
        let Some(idx) = pool.find_backend_by_name(&notification.backend_name) else {
            return;
        };
        let Ok(new_addr) = notification.new_addr.parse::<SocketAddr>() else {
            return;
        };
        pool.backends[idx].replace_address(new_addr);
        pool.rebuild_continuum();

        // Only the primary's connection pool addresses the swapped host;
        // slave connections are unaffected and kept open.
        let key = (notification.pool.clone(), idx, false);
        if let Some(conns) = self.server_conns.remove(&key) {
            for conn_id in conns {
                self.close_connection(conn_id.0, CloseKind::Error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    //! End-to-end exercises of the event loop against real loopback
    //! sockets, covering the spec's §8 scenarios that only manifest once
    //! accept/read/dispatch/forward/pair/write are wired together — the
    //! unit tests elsewhere in this crate cover each piece (parser,
    //! continuum, fragment/coalesce, quota, timeout wheel) in isolation.

    use std::io::{Read, Write};
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use crate::hash::{Distribution, HashFn};
    use crate::pool::backend::BackendServer;
    use crate::pool::{PoolRuntimeConfig, ServerPool};
    use crate::sentinel::SwitchNotification;

    use super::*;

    fn spawn_fake_backend(behavior: impl FnOnce(StdTcpStream) + Send + 'static) -> SocketAddr {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                behavior(stream);
            }
        });
        addr
    }

    fn test_pool_config(name: &str, timeout: Duration, quota: u64, flow_control: bool) -> PoolRuntimeConfig {
        PoolRuntimeConfig {
            name: name.to_string(),
            listen: "127.0.0.1:0".parse().unwrap(),
            hash_fn: HashFn::Md5,
            hash_tag: None,
            distribution: Distribution::Ketama,
            timeout,
            backlog: 128,
            client_connections: 1024,
            server_connections: 1,
            server_retry_timeout: Duration::from_secs(30),
            server_failure_limit: 2,
            auto_eject_hosts: true,
            flow_control,
            quota,
            password: None,
            client_auth: None,
            preconnect: false,
            wire: Wire::Resp,
        }
    }

    fn new_core() -> Core {
        Core::new(
            16 * 1024,
            64 * 1024 * 1024,
            100,
            50,
            Duration::from_secs(120),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    /// Drives `core.tick()` until `rx` yields a value or `deadline` passes.
    fn tick_until<T>(core: &mut Core, rx: &mpsc::Receiver<T>, deadline: Duration) -> T {
        let start = Instant::now();
        loop {
            core.tick().unwrap();
            if let Ok(v) = rx.try_recv() {
                return v;
            }
            if start.elapsed() > deadline {
                panic!("timed out waiting for test signal");
            }
        }
    }

    /// S1: a single `GET` hashes to the only backend and its reply is
    /// written back to the client verbatim.
    #[test]
    fn single_get_routes_to_backend_and_replies() {
        let backend_addr = spawn_fake_backend(|mut stream| {
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("GET"));
            stream.write_all(b"$5\r\nhello\r\n").unwrap();
        });

        let mut core = new_core();
        let pool = ServerPool::new(
            test_pool_config("pool1", Duration::from_millis(2000), 0, false),
            vec![BackendServer::new("shard1".into(), backend_addr, 1, vec![])],
        );
        core.add_pool(pool).unwrap();
        let listen_addr = core.listener_addr("pool1").unwrap();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut stream = StdTcpStream::connect(listen_addr).unwrap();
            stream.write_all(b"*2\r\n$3\r\nGET\r\n$5\r\nkey_1\r\n").unwrap();
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).unwrap_or(0);
            tx.send(buf[..n].to_vec()).unwrap();
        });

        let response = tick_until(&mut core, &rx, Duration::from_secs(3));
        assert_eq!(response, b"$5\r\nhello\r\n");
    }

    /// `client_keepalive_secs` (§6) is applied to every accepted client
    /// socket via `SO_KEEPALIVE`/`TCP_KEEPIDLE`, not just stored.
    #[test]
    fn client_keepalive_is_enabled_on_accepted_sockets() {
        let backend_addr = spawn_fake_backend(|_stream| {
            thread::sleep(Duration::from_secs(5));
        });

        let mut core = new_core();
        core.set_client_keepalive(Some(Duration::from_secs(30)));
        let pool = ServerPool::new(
            test_pool_config("pool1", Duration::from_millis(2000), 0, false),
            vec![BackendServer::new("shard1".into(), backend_addr, 1, vec![])],
        );
        core.add_pool(pool).unwrap();
        let listen_addr = core.listener_addr("pool1").unwrap();

        let (tx, rx) = mpsc::channel::<()>();
        let client = thread::spawn(move || {
            let stream = StdTcpStream::connect(listen_addr).unwrap();
            rx.recv().ok();
            stream
        });

        core.tick().unwrap();
        let token = *core.connections.keys().next().expect("client accepted");
        let conn = &core.connections[&token];
        use std::os::unix::io::AsRawFd;
        let fd = conn.stream.as_raw_fd();
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of_val(&value) as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &mut value as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        assert_ne!(value, 0, "SO_KEEPALIVE should be enabled on the accepted socket");
        tx.send(()).unwrap();
        client.join().unwrap();
    }

    /// S3: a backend that never replies causes the per-request deadline to
    /// expire, the server connection to close, and a synthetic timeout
    /// error to reach the client.
    #[test]
    fn backend_timeout_synthesizes_error_reply() {
        let backend_addr = spawn_fake_backend(|stream| {
            // Hold the connection open without ever writing a reply.
            thread::sleep(Duration::from_secs(5));
            drop(stream);
        });

        let mut core = new_core();
        let pool = ServerPool::new(
            test_pool_config("pool1", Duration::from_millis(50), 0, false),
            vec![BackendServer::new("shard1".into(), backend_addr, 1, vec![])],
        );
        core.add_pool(pool).unwrap();
        let listen_addr = core.listener_addr("pool1").unwrap();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut stream = StdTcpStream::connect(listen_addr).unwrap();
            stream.write_all(b"*2\r\n$3\r\nGET\r\n$5\r\nkey_1\r\n").unwrap();
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).unwrap_or(0);
            tx.send(buf[..n].to_vec()).unwrap();
        });

        let response = tick_until(&mut core, &rx, Duration::from_secs(3));
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with('-'), "expected a RESP error, got {text:?}");
    }

    /// S4: quota exhaustion rejects the third request and marks the client
    /// for close once its queue drains.
    #[test]
    fn quota_exhaustion_rejects_third_request() {
        let backend_addr = spawn_fake_backend(|mut stream| {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        let _ = stream.write_all(b"+OK\r\n");
                    }
                }
            }
        });

        let mut core = new_core();
        let pool = ServerPool::new(
            test_pool_config("pool1", Duration::from_millis(2000), 2, true),
            vec![BackendServer::new("shard1".into(), backend_addr, 1, vec![])],
        );
        core.add_pool(pool).unwrap();
        let listen_addr = core.listener_addr("pool1").unwrap();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut stream = StdTcpStream::connect(listen_addr).unwrap();
            let set = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
            // Pipeline all three "rapid" requests (§8 S4) before reading any
            // reply: the quota gate is a concurrency limiter on admission
            // (tokens are returned once a request is fully retired, §4.J
            // "On req_put ... the token is returned"), so only requests
            // genuinely in flight at once compete for the pool's 2 tokens.
            stream.write_all(set).unwrap();
            stream.write_all(set).unwrap();
            stream.write_all(set).unwrap();
            let mut replies = Vec::new();
            for _ in 0..3 {
                let mut buf = [0u8; 256];
                let n = stream.read(&mut buf).unwrap_or(0);
                replies.push(buf[..n].to_vec());
            }
            tx.send(replies).unwrap();
        });

        let replies = tick_until(&mut core, &rx, Duration::from_secs(3));
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], b"+OK\r\n");
        assert_eq!(replies[1], b"+OK\r\n");
        assert!(String::from_utf8_lossy(&replies[2]).starts_with('-'));
    }

    /// §4.J "On `req_put` ... the token is returned": once a request
    /// completes, its token goes back to the pool immediately rather than
    /// waiting for the refill timer, so a quota of 1 still serves many
    /// sequential (non-pipelined) requests on one connection.
    #[test]
    fn completed_request_returns_its_token_immediately() {
        let backend_addr = spawn_fake_backend(|mut stream| {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        let _ = stream.write_all(b"+OK\r\n");
                    }
                }
            }
        });

        let mut core = new_core();
        let pool = ServerPool::new(
            test_pool_config("pool1", Duration::from_millis(2000), 1, true),
            vec![BackendServer::new("shard1".into(), backend_addr, 1, vec![])],
        );
        core.add_pool(pool).unwrap();
        let listen_addr = core.listener_addr("pool1").unwrap();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut stream = StdTcpStream::connect(listen_addr).unwrap();
            let set = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
            let mut replies = Vec::new();
            for _ in 0..5 {
                stream.write_all(set).unwrap();
                let mut buf = [0u8; 256];
                let n = stream.read(&mut buf).unwrap_or(0);
                replies.push(buf[..n].to_vec());
            }
            tx.send(replies).unwrap();
        });

        let replies = tick_until(&mut core, &rx, Duration::from_secs(3));
        assert_eq!(replies.len(), 5);
        for reply in &replies {
            assert_eq!(reply, b"+OK\r\n");
        }
    }

    /// S5: a sentinel master-switch notification updates the backend's
    /// address and tears down the existing server connection.
    #[test]
    fn sentinel_notification_swaps_backend_address() {
        let mut core = new_core();
        let old_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let pool = ServerPool::new(
            test_pool_config("pool1", Duration::from_millis(2000), 0, false),
            vec![BackendServer::new("shard1".into(), old_addr, 1, vec![])],
        );
        core.add_pool(pool).unwrap();

        let new_addr: SocketAddr = "10.0.0.2:6380".parse().unwrap();
        core.apply_switch_notification(SwitchNotification {
            pool: "pool1".to_string(),
            backend_name: "shard1".to_string(),
            old_addr: old_addr.to_string(),
            new_addr: new_addr.to_string(),
        });

        assert_eq!(core.pools["pool1"].backends[0].addr, new_addr);
    }

    #[test]
    fn sentinel_notification_for_unknown_pool_is_ignored() {
        let mut core = new_core();
        let pool = ServerPool::new(
            test_pool_config("pool1", Duration::from_millis(2000), 0, false),
            vec![BackendServer::new(
                "shard1".into(),
                "127.0.0.1:1".parse().unwrap(),
                1,
                vec![],
            )],
        );
        core.add_pool(pool).unwrap();

        core.apply_switch_notification(SwitchNotification {
            pool: "no-such-pool".to_string(),
            backend_name: "shard1".to_string(),
            old_addr: "127.0.0.1:1".to_string(),
            new_addr: "10.0.0.2:6380".to_string(),
        });

        assert_eq!(core.pools["pool1"].backends[0].addr, "127.0.0.1:1".parse::<SocketAddr>().unwrap());
    }

    /// §4.F "Master-slave slave selection": a read-only `GET` against a
    /// backend configured with a slave is routed to the slave, while a
    /// `SET` against the same backend still reaches the primary.
    #[test]
    fn read_command_routes_to_slave_write_command_routes_to_primary() {
        let (primary_tx, primary_rx) = mpsc::channel();
        let primary_addr = spawn_fake_backend(move |mut stream| {
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).unwrap();
            primary_tx.send(String::from_utf8_lossy(&buf[..n]).to_string()).unwrap();
            stream.write_all(b"+OK\r\n").unwrap();
        });
        let (slave_tx, slave_rx) = mpsc::channel();
        let slave_addr = spawn_fake_backend(move |mut stream| {
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).unwrap();
            slave_tx.send(String::from_utf8_lossy(&buf[..n]).to_string()).unwrap();
            stream.write_all(b"$5\r\nhello\r\n").unwrap();
        });

        let mut core = new_core();
        let pool = ServerPool::new(
            test_pool_config("pool1", Duration::from_millis(2000), 0, false),
            vec![BackendServer::new(
                "shard1".into(),
                primary_addr,
                1,
                vec![slave_addr],
            )],
        );
        core.add_pool(pool).unwrap();
        let listen_addr = core.listener_addr("pool1").unwrap();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut stream = StdTcpStream::connect(listen_addr).unwrap();
            stream.write_all(b"*2\r\n$3\r\nGET\r\n$5\r\nkey_1\r\n").unwrap();
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).unwrap_or(0);
            let get_reply = buf[..n].to_vec();

            stream.write_all(b"*3\r\n$3\r\nSET\r\n$5\r\nkey_1\r\n$1\r\nv\r\n").unwrap();
            let n = stream.read(&mut buf).unwrap_or(0);
            let set_reply = buf[..n].to_vec();
            tx.send((get_reply, set_reply)).unwrap();
        });

        let (get_reply, set_reply) = tick_until(&mut core, &rx, Duration::from_secs(3));
        assert_eq!(get_reply, b"$5\r\nhello\r\n");
        assert_eq!(set_reply, b"+OK\r\n");

        let slave_request = slave_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(slave_request.contains("GET"));
        let primary_request = primary_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(primary_request.contains("SET"));
    }
}

/// Resolves the bytes a queued message should contribute to a `writev`
/// (§4.D write path): a server-bound request writes its own wire bytes
/// verbatim; a client-bound (once-done) request writes its override or its
/// paired response's bytes.
fn outbound_bytes(msg: &Message) -> Vec<u8> {
    let state = msg.borrow();
    if let Some(override_bytes) = &state.reply_override {
        return override_bytes.clone();
    }
    if let Some(peer) = state.peer.upgrade() {
        return peer.borrow().chain.to_contiguous();
    }
    state.chain.to_contiguous()
}
