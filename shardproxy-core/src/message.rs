//! The protocol-level request/response unit.
//!
//! A [`Message`] is a shared handle (`Rc<RefCell<..>>`) rather than an index
//! into a slab: the pipeline is strictly single-threaded so there is no need
//! for `Arc`/`Mutex`, and a fragment parent genuinely is referenced from
//! several places at once (the client's outbound queue, and each child's
//! `frag_owner` back-pointer) for the lifetime of the fragment. `Weak` links
//! are used everywhere the spec calls for a non-owning reference (owning
//! connection, request/response peer, fragment parent) so connection close
//! can drop its queues and have dangling peers simply become `None` on next
//! upgrade, instead of needing an explicit sweep.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::buffer::Chain;
use crate::conn::ConnId;
use crate::parser::resp::ParserState;
use crate::protocol::Permission;

static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgId(pub u64);

impl MsgId {
    pub fn next() -> Self {
        MsgId(NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Command discriminator recorded by the parser. `Other` carries the raw
/// command name uppercased, for commands this proxy forwards unmodified
/// without needing to reason about keys or fragmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get,
    Set,
    MGet,
    MSet,
    Del,
    Exists,
    Sadd,
    Rpush,
    Hmset,
    Eval,
    Ping,
    Quit,
    Auth,
    Broadcast,
    Other(String),
}

impl Command {
    /// Byte range within a message's key list that this command family
    /// treats as keys for routing purposes is computed by the parser per
    /// command; this just reports the read/write/exec permission bit used
    /// by the permission filter (§4.D step 1).
    pub fn permission(&self) -> Permission {
        match self {
            Command::Get
            | Command::MGet
            | Command::Exists
            | Command::Ping
            | Command::Broadcast => Permission::Read,
            Command::Set
            | Command::MSet
            | Command::Del
            | Command::Sadd
            | Command::Rpush
            | Command::Hmset => Permission::Write,
            Command::Eval => Permission::Exec,
            Command::Quit | Command::Auth => Permission::Read,
            Command::Other(_) => Permission::Read,
        }
    }

    /// Whether this command is one of the multi-key fragmentable families
    /// (§4.G); `Broadcast` is fragmented but not by key.
    pub fn is_multi_key(&self) -> bool {
        matches!(
            self,
            Command::MGet
                | Command::MSet
                | Command::Del
                | Command::Exists
                | Command::Sadd
                | Command::Rpush
                | Command::Hmset
        )
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Get => "GET",
            Command::Set => "SET",
            Command::MGet => "MGET",
            Command::MSet => "MSET",
            Command::Del => "DEL",
            Command::Exists => "EXISTS",
            Command::Sadd => "SADD",
            Command::Rpush => "RPUSH",
            Command::Hmset => "HMSET",
            Command::Eval => "EVAL",
            Command::Ping => "PING",
            Command::Quit => "QUIT",
            Command::Auth => "AUTH",
            Command::Broadcast => "BROADCAST",
            Command::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Command {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Command::Get,
            "SET" => Command::Set,
            "MGET" => Command::MGet,
            "MSET" => Command::MSet,
            "DEL" => Command::Del,
            "EXISTS" => Command::Exists,
            "SADD" => Command::Sadd,
            "RPUSH" => Command::Rpush,
            "HMSET" => Command::Hmset,
            "EVAL" => Command::Eval,
            "PING" => Command::Ping,
            "QUIT" => Command::Quit,
            "AUTH" => Command::Auth,
            "BROADCAST" => Command::Broadcast,
            other => Command::Other(other.to_string()),
        }
    }
}

/// One key argument: its byte range within the original request buffer (used
/// when slicing raw bytes for a fragment child) plus an owned copy of the
/// key's bytes (used for hashing and routing). Keeping both avoids the
/// lifetime gymnastics of borrowing into a chain that may be mutated or
/// moved by the time routing runs.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub start: usize,
    pub end: usize,
    pub value: Vec<u8>,
    /// For `KeyShape::Pairs` commands (`MSET`-style), the value argument
    /// immediately following this key, so a fragment child can rebuild a
    /// valid `key value` pair for its shard.
    pub pair_value: Option<Vec<u8>>,
}

/// Fragmentation bookkeeping, present only on parent/child messages produced
/// by the fragment engine (§4.G). `None` for ordinary single-shard messages.
#[derive(Debug, Clone)]
pub struct FragState {
    pub frag_id: u64,
    /// Total number of children split off this parent.
    pub nfrag: usize,
    /// Number of children whose response has arrived.
    pub nfrag_done: usize,
    /// Set if any child's response was an error.
    pub ferror: bool,
    /// Per-child original key indices, in child-creation order (which is
    /// ascending backend index — see `fragment::fragment_multi_key`). Parallel
    /// to `MessageState::fragment_replies`; consumed by the coalescer to
    /// restore client-visible key order (`MGET`) or backend-index order
    /// (`BROADCAST`).
    pub key_indices: Vec<Vec<usize>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MessageFlags {
    pub quit: bool,
    pub noreply: bool,
    pub noforward: bool,
    pub done: bool,
    pub swallow: bool,
    pub error: bool,
    pub ferror: bool,
    pub ticket: bool,
}

pub struct MessageState {
    pub id: MsgId,
    pub direction: Direction,
    pub chain: Chain,
    pub parser_state: ParserState,
    pub command: Option<Command>,
    pub keys: Vec<KeyRange>,
    pub frag: Option<FragState>,
    pub flags: MessageFlags,
    pub owner: Option<ConnId>,
    /// Pool this request was admitted under, set alongside `flags.ticket`.
    /// Looked up independently of the owning connection so a consumed
    /// quota token is still returned to the right pool even if the client
    /// disconnects before the backend replies (§4.J, §8 property 5).
    pub quota_pool: Option<String>,
    pub peer: Weak<RefCell<MessageState>>,
    pub frag_owner: Weak<RefCell<MessageState>>,
    /// This child's position in its parent's `fragment_replies`/`key_indices`
    /// (ascending backend order, per `fragment::fragment_multi_key`) — lets
    /// the event loop write a late reply into the right slot instead of the
    /// first empty one, which would scramble `BROADCAST`'s backend-index
    /// ordering under out-of-order backend responses.
    pub frag_slot: Option<usize>,
    pub ingress: Instant,
    /// Deadline registered in the timeout wheel, if any.
    pub deadline: Option<Instant>,
    /// Raw reply bytes collected for coalescing, one slot per child,
    /// populated as each child's response arrives.
    pub fragment_replies: Vec<Option<Vec<u8>>>,
    /// Bytes the event loop should write to the client in place of
    /// `peer`'s own chain: set for a coalesced fragment reply, a locally
    /// synthesized error (quota/permission/timeout/backend failure), or a
    /// locally-answered `PING`/`AUTH`. `None` means "write `peer`'s chain
    /// verbatim", the common single-shard case.
    pub reply_override: Option<Vec<u8>>,
}

pub type Message = Rc<RefCell<MessageState>>;

pub fn new_message(direction: Direction, chain: Chain) -> Message {
    Rc::new(RefCell::new(MessageState {
        id: MsgId::next(),
        direction,
        chain,
        parser_state: ParserState::new(),
        command: None,
        keys: Vec::new(),
        frag: None,
        flags: MessageFlags::default(),
        owner: None,
        quota_pool: None,
        peer: Weak::new(),
        frag_owner: Weak::new(),
        frag_slot: None,
        ingress: Instant::now(),
        deadline: None,
        fragment_replies: Vec::new(),
        reply_override: None,
    }))
}

pub trait MessageExt {
    fn mark_done(&self);
    fn is_done(&self) -> bool;
}

impl MessageExt for Message {
    fn mark_done(&self) {
        self.borrow_mut().flags.done = true;
    }

    fn is_done(&self) -> bool {
        self.borrow().flags.done
    }
}
