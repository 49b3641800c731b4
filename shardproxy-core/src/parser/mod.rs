//! Incremental RESP parsing (§4.C).
//!
//! The spec names four return kinds: `OK`, `AGAIN`, `REPAIR`, `ERROR`.
//! `REPAIR` ("parsed portion complete, but the chain must be split so the
//! remainder begins a new message") is not a distinct variant here: a parser
//! only ever sees one contiguous read, returns [`ParseOutcome::Complete`]
//! with how many bytes it consumed, and it is the *connection*'s read loop
//! (§4.D) that splits the chain at that offset and feeds the surplus back in
//! as the start of the next message. Folding `REPAIR` into "the caller
//! splits after every `Complete`" removes a redundant state without changing
//! behavior — every `Complete` is already followed by exactly that split
//! whenever more bytes remain.
pub mod commands;
pub mod resp;

use crate::error::CoreError;
use crate::message::{Command, KeyRange};

#[derive(Debug)]
pub enum ParseOutcome<T> {
    Complete(T, usize),
    Again,
}

/// What the RESP request parser extracts from one complete message, before
/// it is installed into a [`crate::message::MessageState`].
#[derive(Debug)]
pub struct ParsedMessage {
    pub command: Command,
    pub keys: Vec<KeyRange>,
    pub inline: bool,
}

pub type ParseResult<T> = Result<ParseOutcome<T>, CoreError>;
