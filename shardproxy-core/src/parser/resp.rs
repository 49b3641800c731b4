//! The RESP state machine (§4.C).
//!
//! Each call parses as much of a complete message as `buf` contains and
//! either returns [`ParseOutcome::Complete`] with the number of bytes
//! consumed, or [`ParseOutcome::Again`] if `buf` doesn't yet hold a whole
//! message. Because the connection read loop re-invokes the parser against
//! the whole accumulated read buffer on every readiness event (rather than
//! the parser remembering a byte-by-byte cursor across calls), `ParserState`
//! carries only the bookkeeping that genuinely needs to survive between
//! messages on the same connection (currently none beyond a depth counter
//! reserved for future streaming support) — see the module doc on `mod.rs`.

use crate::error::CoreError;
use crate::message::{Command, KeyRange};
use crate::parser::commands::{self, KeyShape};
use crate::parser::{ParseOutcome, ParseResult, ParsedMessage};

const MAX_MULTIBULK_DEPTH: u32 = 3;
const MAX_INLINE_LEN: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct ParserState {
    pub depth: u32,
}

impl ParserState {
    pub fn new() -> Self {
        ParserState { depth: 0 }
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
    // NB: O(n) per scan; acceptable for the message sizes this proxy expects
    // and keeps the state machine reparse-from-scratch model simple.
}

fn parse_len_line(buf: &[u8], start: usize) -> Result<Option<(i64, usize)>, CoreError> {
    let Some(crlf) = find_crlf(buf, start) else {
        return Ok(None);
    };
    let s = std::str::from_utf8(&buf[start..crlf])
        .map_err(|_| CoreError::ProtocolViolation("non-utf8 length line".into()))?;
    let n: i64 = s
        .parse()
        .map_err(|_| CoreError::ProtocolViolation(format!("invalid length {s:?}")))?;
    Ok(Some((n, crlf + 2)))
}

/// Parses one inline command: a single CRLF-terminated line, tokens
/// separated by runs of whitespace.
fn parse_inline(buf: &[u8]) -> ParseResult<ParsedMessage> {
    let Some(crlf) = find_crlf(buf, 0) else {
        if buf.len() > MAX_INLINE_LEN {
            return Err(CoreError::ProtocolViolation(
                "inline request too long".into(),
            ));
        }
        return Ok(ParseOutcome::Again);
    };
    let line = &buf[..crlf];
    let mut tokens: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i < line.len() {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= line.len() {
            break;
        }
        let start = i;
        while i < line.len() && !line[i].is_ascii_whitespace() {
            i += 1;
        }
        tokens.push((start, i));
    }
    if tokens.is_empty() {
        // An empty inline line is a no-op request the connection filters out
        // (§4.D step 1, "empty message -> drop").
        return Ok(ParseOutcome::Complete(
            ParsedMessage {
                command: Command::Other(String::new()),
                keys: Vec::new(),
                inline: true,
            },
            crlf + 2,
        ));
    }
    let (name_start, name_end) = tokens[0];
    let name = std::str::from_utf8(&line[name_start..name_end])
        .map_err(|_| CoreError::ProtocolViolation("non-utf8 command name".into()))?;
    let command = resolve_command(name);
    let spec = commands::lookup(name);
    let arg_ranges: Vec<(usize, usize)> = tokens[1..].to_vec();
    let keys = keys_from_ranges(line, &arg_ranges, spec.key_shape);
    Ok(ParseOutcome::Complete(
        ParsedMessage {
            command,
            keys,
            inline: true,
        },
        crlf + 2,
    ))
}

fn resolve_command(name: &str) -> Command {
    if commands::is_known(name) {
        Command::from_name(name)
    } else {
        Command::Other(name.to_ascii_uppercase())
    }
}

fn keys_from_ranges(buf: &[u8], args: &[(usize, usize)], shape: KeyShape) -> Vec<KeyRange> {
    let plain = |&(s, e): &(usize, usize)| KeyRange {
        start: s,
        end: e,
        value: buf[s..e].to_vec(),
        pair_value: None,
    };
    match shape {
        KeyShape::None => Vec::new(),
        KeyShape::First => args.first().map(plain).into_iter().collect(),
        KeyShape::Every => args.iter().map(plain).collect(),
        KeyShape::Pairs => args
            .chunks(2)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (s, e) = pair[0];
                KeyRange {
                    start: s,
                    end: e,
                    value: buf[s..e].to_vec(),
                    pair_value: pair.get(1).map(|&(vs, ve)| buf[vs..ve].to_vec()),
                }
            })
            .collect(),
    }
}

/// Builds a RESP multi-bulk request from a command name and raw argument
/// bytes. Used by the fragment engine to rebuild a valid single-shard
/// command for each child, and by the connection layer to prime new server
/// connections with `AUTH` (§4.F, §6).
pub fn encode_multibulk<'a>(command: &str, args: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let args: Vec<&[u8]> = args.into_iter().collect();
    let mut out = Vec::new();
    out.extend_from_slice(format!("*{}\r\n", args.len() + 1).as_bytes());
    out.extend_from_slice(format!("${}\r\n", command.len()).as_bytes());
    out.extend_from_slice(command.as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Parses one multi-bulk (`*N\r\n$L\r\n<bytes>\r\n...`) request.
fn parse_multibulk(buf: &[u8]) -> ParseResult<ParsedMessage> {
    let Some((count, mut pos)) = parse_len_line(buf, 1)? else {
        return Ok(ParseOutcome::Again);
    };
    if count <= 0 {
        return Err(CoreError::ProtocolViolation(
            "multi-bulk request with non-positive argument count".into(),
        ));
    }
    let mut bulk_ranges: Vec<(usize, usize)> = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() || buf[pos] != b'$' {
            if pos >= buf.len() {
                return Ok(ParseOutcome::Again);
            }
            return Err(CoreError::ProtocolViolation(format!(
                "expected bulk string header, got {:?}",
                buf[pos] as char
            )));
        }
        let Some((len, after_len_line)) = parse_len_line(buf, pos + 1)? else {
            return Ok(ParseOutcome::Again);
        };
        if len < -1 {
            return Err(CoreError::ProtocolViolation("negative bulk length".into()));
        }
        if len == -1 {
            // null bulk argument: treat as an empty argument for routing.
            bulk_ranges.push((after_len_line, after_len_line));
            pos = after_len_line;
            continue;
        }
        let len = len as usize;
        let body_start = after_len_line;
        let body_end = body_start + len;
        if buf.len() < body_end + 2 {
            return Ok(ParseOutcome::Again);
        }
        if &buf[body_end..body_end + 2] != b"\r\n" {
            return Err(CoreError::ProtocolViolation(
                "missing CRLF terminator after bulk body".into(),
            ));
        }
        bulk_ranges.push((body_start, body_end));
        pos = body_end + 2;
    }
    if bulk_ranges.is_empty() {
        return Err(CoreError::ProtocolViolation("multi-bulk with no command".into()));
    }
    let (name_start, name_end) = bulk_ranges[0];
    let name = std::str::from_utf8(&buf[name_start..name_end])
        .map_err(|_| CoreError::ProtocolViolation("non-utf8 command name".into()))?;
    let command = resolve_command(name);
    let spec = commands::lookup(name);
    let keys = keys_from_ranges(buf, &bulk_ranges[1..], spec.key_shape);
    Ok(ParseOutcome::Complete(
        ParsedMessage {
            command,
            keys,
            inline: false,
        },
        pos,
    ))
}

pub fn parse_request(buf: &[u8]) -> ParseResult<ParsedMessage> {
    if buf.is_empty() {
        return Ok(ParseOutcome::Again);
    }
    if buf[0] == b'*' {
        parse_multibulk(buf)
    } else {
        parse_inline(buf)
    }
}

/// A parsed RESP reply value, nested multi-bulk up to depth 3 (§4.C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(Vec<u8>),
    Error(Vec<u8>),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn error(msg: impl Into<String>) -> RespValue {
        RespValue::Error(msg.into().into_bytes())
    }

    pub fn ok() -> RespValue {
        RespValue::Simple(b"OK".to_vec())
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                out.push(b':');
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            RespValue::Bulk(Some(b)) => {
                out.push(b'$');
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(b);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
            RespValue::Array(Some(items)) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.serialize(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize(&mut out);
        out
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

fn parse_value(buf: &[u8], depth: u32) -> ParseResult<RespValue> {
    if buf.is_empty() {
        return Ok(ParseOutcome::Again);
    }
    match buf[0] {
        b'+' => {
            let Some(crlf) = find_crlf(buf, 1) else {
                return Ok(ParseOutcome::Again);
            };
            Ok(ParseOutcome::Complete(
                RespValue::Simple(buf[1..crlf].to_vec()),
                crlf + 2,
            ))
        }
        b'-' => {
            let Some(crlf) = find_crlf(buf, 1) else {
                return Ok(ParseOutcome::Again);
            };
            Ok(ParseOutcome::Complete(
                RespValue::Error(buf[1..crlf].to_vec()),
                crlf + 2,
            ))
        }
        b':' => {
            let Some(crlf) = find_crlf(buf, 1) else {
                return Ok(ParseOutcome::Again);
            };
            let s = std::str::from_utf8(&buf[1..crlf])
                .map_err(|_| CoreError::ProtocolViolation("non-utf8 integer reply".into()))?;
            let n: i64 = s
                .parse()
                .map_err(|_| CoreError::ProtocolViolation(format!("invalid integer {s:?}")))?;
            Ok(ParseOutcome::Complete(RespValue::Integer(n), crlf + 2))
        }
        b'$' => {
            let Some((len, after_len_line)) = parse_len_line(buf, 1)? else {
                return Ok(ParseOutcome::Again);
            };
            if len == -1 {
                return Ok(ParseOutcome::Complete(RespValue::Bulk(None), after_len_line));
            }
            if len < -1 {
                return Err(CoreError::ProtocolViolation("negative bulk length".into()));
            }
            let len = len as usize;
            let body_end = after_len_line + len;
            if buf.len() < body_end + 2 {
                return Ok(ParseOutcome::Again);
            }
            if &buf[body_end..body_end + 2] != b"\r\n" {
                return Err(CoreError::ProtocolViolation(
                    "missing CRLF terminator after bulk body".into(),
                ));
            }
            Ok(ParseOutcome::Complete(
                RespValue::Bulk(Some(buf[after_len_line..body_end].to_vec())),
                body_end + 2,
            ))
        }
        b'*' => {
            if depth >= MAX_MULTIBULK_DEPTH {
                return Err(CoreError::ProtocolViolation(
                    "multi-bulk nesting exceeds depth 3".into(),
                ));
            }
            let Some((count, mut pos)) = parse_len_line(buf, 1)? else {
                return Ok(ParseOutcome::Again);
            };
            if count == -1 {
                return Ok(ParseOutcome::Complete(RespValue::Array(None), pos));
            }
            if count < -1 {
                return Err(CoreError::ProtocolViolation("negative array length".into()));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match parse_value(&buf[pos..], depth + 1)? {
                    ParseOutcome::Complete(v, consumed) => {
                        items.push(v);
                        pos += consumed;
                    }
                    ParseOutcome::Again => return Ok(ParseOutcome::Again),
                }
            }
            Ok(ParseOutcome::Complete(RespValue::Array(Some(items)), pos))
        }
        other => Err(CoreError::ProtocolViolation(format!(
            "unknown reply type byte {:?}",
            other as char
        ))),
    }
}

pub fn parse_response(buf: &[u8]) -> ParseResult<RespValue> {
    parse_value(buf, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inline_ping() {
        let buf = b"PING\r\n";
        match parse_request(buf).unwrap() {
            ParseOutcome::Complete(msg, consumed) => {
                assert_eq!(consumed, buf.len());
                assert_eq!(msg.command, Command::Ping);
            }
            ParseOutcome::Again => panic!("expected complete"),
        }
    }

    #[test]
    fn parses_multibulk_get() {
        let buf = b"*2\r\n$3\r\nGET\r\n$5\r\nkey_1\r\n";
        match parse_request(buf).unwrap() {
            ParseOutcome::Complete(msg, consumed) => {
                assert_eq!(consumed, buf.len());
                assert_eq!(msg.command, Command::Get);
                assert_eq!(msg.keys.len(), 1);
                assert_eq!(msg.keys[0].value, b"key_1");
            }
            ParseOutcome::Again => panic!("expected complete"),
        }
    }

    #[test]
    fn multibulk_mget_collects_every_key() {
        let buf = b"*4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n";
        match parse_request(buf).unwrap() {
            ParseOutcome::Complete(msg, _) => {
                assert_eq!(msg.command, Command::MGet);
                let keys: Vec<&[u8]> = msg.keys.iter().map(|k| k.value.as_slice()).collect();
                assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
            }
            ParseOutcome::Again => panic!("expected complete"),
        }
    }

    #[test]
    fn partial_multibulk_reports_again() {
        let buf = b"*2\r\n$3\r\nGET\r\n$5\r\nke";
        assert!(matches!(parse_request(buf).unwrap(), ParseOutcome::Again));
    }

    #[test]
    fn boundary_inside_length_line_is_again() {
        for cut in 1..b"*2\r\n$3\r\nGET\r\n$5\r\nkey_1\r\n".len() {
            let full = b"*2\r\n$3\r\nGET\r\n$5\r\nkey_1\r\n";
            let partial = &full[..cut];
            let result = parse_request(partial).unwrap();
            if cut == full.len() {
                assert!(matches!(result, ParseOutcome::Complete(_, _)));
            } else {
                assert!(matches!(result, ParseOutcome::Again), "cut={cut}");
            }
        }
    }

    #[test]
    fn unknown_command_is_forwarded_as_other() {
        let buf = b"*1\r\n$10\r\nFROBNICATE\r\n";
        match parse_request(buf).unwrap() {
            ParseOutcome::Complete(msg, _) => {
                assert_eq!(msg.command, Command::Other("FROBNICATE".to_string()));
            }
            ParseOutcome::Again => panic!("expected complete"),
        }
    }

    #[test]
    fn response_parses_nested_multibulk() {
        let buf = b"*2\r\n$1\r\na\r\n*1\r\n$1\r\nb\r\n";
        match parse_response(buf).unwrap() {
            ParseOutcome::Complete(RespValue::Array(Some(items)), consumed) => {
                assert_eq!(consumed, buf.len());
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[1], RespValue::Array(Some(inner)) if inner.len() == 1));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn response_roundtrip_serialize() {
        let v = RespValue::Array(Some(vec![
            RespValue::Bulk(Some(b"A".to_vec())),
            RespValue::Bulk(None),
            RespValue::Integer(42),
        ]));
        let bytes = v.to_bytes();
        match parse_response(&bytes).unwrap() {
            ParseOutcome::Complete(parsed, consumed) => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(parsed, v);
            }
            ParseOutcome::Again => panic!("expected complete"),
        }
    }

    #[test]
    fn encode_multibulk_round_trips_through_parser() {
        let bytes = encode_multibulk("MGET", [b"a".as_ref(), b"c".as_ref()]);
        match parse_request(&bytes).unwrap() {
            ParseOutcome::Complete(msg, consumed) => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(msg.command, Command::MGet);
                assert_eq!(msg.keys.len(), 2);
            }
            ParseOutcome::Again => panic!("expected complete"),
        }
    }

    #[test]
    fn excessive_multibulk_depth_errors() {
        let buf = b"*1\r\n*1\r\n*1\r\n*1\r\n:1\r\n";
        assert!(parse_response(buf).is_err());
    }
}
