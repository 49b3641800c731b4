//! The fixed command table (§4.C): name → discriminator, permission bit,
//! arity class, and key-position shape. Built once at startup and immutable
//! thereafter (§9 "Global process state").

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::message::Command;

/// Where keys live among a command's arguments, used by both the parser (to
/// populate `Message::keys`) and the fragment engine (§4.G) to decide how to
/// partition a multi-key command per shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    /// No key arguments (e.g. `PING`).
    None,
    /// The single first argument is the key (e.g. `GET`).
    First,
    /// Every remaining argument is its own key (`MGET`, `DEL`, `EXISTS`).
    Every,
    /// Arguments alternate key, value, key, value, ... (`MSET`, `HMSET`-style
    /// multi-key set).
    Pairs,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub command_ctor: fn() -> Command,
    pub min_args: usize,
    pub key_shape: KeyShape,
}

macro_rules! spec {
    ($ctor:expr, $min:expr, $shape:expr) => {
        CommandSpec {
            command_ctor: $ctor,
            min_args: $min,
            key_shape: $shape,
        }
    };
}

static COMMAND_TABLE: Lazy<HashMap<&'static str, CommandSpec>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("GET", spec!(|| Command::Get, 1, KeyShape::First));
    m.insert("SET", spec!(|| Command::Set, 2, KeyShape::First));
    m.insert("MGET", spec!(|| Command::MGet, 1, KeyShape::Every));
    m.insert("MSET", spec!(|| Command::MSet, 2, KeyShape::Pairs));
    m.insert("DEL", spec!(|| Command::Del, 1, KeyShape::Every));
    m.insert("EXISTS", spec!(|| Command::Exists, 1, KeyShape::Every));
    m.insert("SADD", spec!(|| Command::Sadd, 2, KeyShape::First));
    m.insert("RPUSH", spec!(|| Command::Rpush, 2, KeyShape::First));
    m.insert("HMSET", spec!(|| Command::Hmset, 3, KeyShape::First));
    m.insert("EVAL", spec!(|| Command::Eval, 2, KeyShape::None));
    m.insert("PING", spec!(|| Command::Ping, 0, KeyShape::None));
    m.insert("QUIT", spec!(|| Command::Quit, 0, KeyShape::None));
    m.insert("AUTH", spec!(|| Command::Auth, 1, KeyShape::None));
    m.insert("BROADCAST", spec!(|| Command::Broadcast, 1, KeyShape::None));
    m
});

/// Looks up a command by case-insensitive name. Commands absent from the
/// table are still accepted (forwarded as `Command::Other`, `KeyShape::None`)
/// rather than rejected, matching the wide command surface Redis exposes
/// that this proxy has no special routing logic for.
pub fn lookup(name: &str) -> CommandSpec {
    let upper = name.to_ascii_uppercase();
    COMMAND_TABLE.get(upper.as_str()).copied().unwrap_or(CommandSpec {
        command_ctor: || unreachable!("Other is constructed by the caller with the raw name"),
        min_args: 0,
        key_shape: KeyShape::None,
    })
}

pub fn is_known(name: &str) -> bool {
    COMMAND_TABLE.contains_key(name.to_ascii_uppercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mget_has_every_key_shape() {
        let spec = lookup("mget");
        assert_eq!(spec.key_shape, KeyShape::Every);
        assert!(matches!((spec.command_ctor)(), Command::MGet));
    }

    #[test]
    fn unknown_command_is_not_in_table() {
        assert!(!is_known("FROBNICATE"));
    }
}
