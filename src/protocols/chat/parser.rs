//! Chat protocol parser.

use bytes::Bytes;
use std::fmt;

use crate::protocols;

/// Parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Pick an identifier.
    Nick(String),
    /// Send text to one named client.
    Msg { to: String, text: Bytes },
    /// Send text to everyone else.
    All(Bytes),
    /// Liveness check, optionally echoing a message.
    Ping(Option<Bytes>),
    /// Close the connection.
    Quit,
}

/// A complete line that is not a valid command. The line is consumed and
/// the client gets an error reply; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    UnknownCommand(String),
    MissingArgument(&'static str),
    InvalidId,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty line"),
            ParseError::UnknownCommand(verb) => write!(f, "unknown command '{verb}'"),
            ParseError::MissingArgument(what) => write!(f, "missing {what}"),
            ParseError::InvalidId => write!(f, "invalid id"),
        }
    }
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Command with bytes consumed (line plus terminator).
    Complete(Command, usize),
    /// Invalid line with bytes consumed.
    Rejected(ParseError, usize),
    /// No full line yet.
    Incomplete,
    /// Line longer than the limit. The stream cannot be resynchronised.
    Overflow,
}

/// Parse one command line from the front of `input`.
///
/// Lines end in `\n`; a preceding `\r` is stripped. `max_line` bounds the
/// line without its terminator.
pub fn parse(input: &[u8], max_line: usize) -> ParseResult {
    let Some(newline) = input.iter().position(|&b| b == b'\n') else {
        // A trailing `\r` may be the first half of a CRLF still in flight
        let pending = input.strip_suffix(b"\r").unwrap_or(input);
        return if pending.len() > max_line {
            ParseResult::Overflow
        } else {
            ParseResult::Incomplete
        };
    };

    let consumed = newline + 1;
    let line = input[..newline].strip_suffix(b"\r").unwrap_or(&input[..newline]);
    if line.len() > max_line {
        return ParseResult::Overflow;
    }

    match parse_line(line) {
        Ok(command) => ParseResult::Complete(command, consumed),
        Err(e) => ParseResult::Rejected(e, consumed),
    }
}

fn parse_line(line: &[u8]) -> Result<Command, ParseError> {
    let (verb, rest) = split_word(line);
    if verb.is_empty() {
        return Err(ParseError::Empty);
    }

    if verb.eq_ignore_ascii_case(b"NICK") {
        let (id, extra) = split_word(rest);
        if id.is_empty() {
            return Err(ParseError::MissingArgument("id"));
        }
        if !extra.is_empty() {
            return Err(ParseError::InvalidId);
        }
        Ok(Command::Nick(parse_id(id)?))
    } else if verb.eq_ignore_ascii_case(b"MSG") {
        let (to, text) = split_word(rest);
        if to.is_empty() {
            return Err(ParseError::MissingArgument("receiver"));
        }
        if text.is_empty() {
            return Err(ParseError::MissingArgument("text"));
        }
        Ok(Command::Msg {
            to: parse_id(to)?,
            text: Bytes::copy_from_slice(text),
        })
    } else if verb.eq_ignore_ascii_case(b"ALL") {
        if rest.is_empty() {
            return Err(ParseError::MissingArgument("text"));
        }
        Ok(Command::All(Bytes::copy_from_slice(rest)))
    } else if verb.eq_ignore_ascii_case(b"PING") {
        let message = (!rest.is_empty()).then(|| Bytes::copy_from_slice(rest));
        Ok(Command::Ping(message))
    } else if verb.eq_ignore_ascii_case(b"QUIT") {
        Ok(Command::Quit)
    } else {
        Err(ParseError::UnknownCommand(
            String::from_utf8_lossy(verb).into_owned(),
        ))
    }
}

fn parse_id(raw: &[u8]) -> Result<String, ParseError> {
    protocols::parse_id(raw).ok_or(ParseError::InvalidId)
}

/// Split off the first space-delimited word. The remainder has its leading
/// spaces removed.
fn split_word(input: &[u8]) -> (&[u8], &[u8]) {
    let input = trim_start(input);
    match input.iter().position(|&b| b == b' ') {
        Some(pos) => (&input[..pos], trim_start(&input[pos..])),
        None => (input, &input[input.len()..]),
    }
}

fn trim_start(input: &[u8]) -> &[u8] {
    let start = input.iter().position(|&b| b != b' ').unwrap_or(input.len());
    &input[start..]
}

/// Format a message delivered from `sender`.
pub fn delivery(sender: &str, text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + sender.len() + 1 + text.len() + 2);
    out.extend_from_slice(b"FROM ");
    out.extend_from_slice(sender.as_bytes());
    out.push(b' ');
    out.extend_from_slice(text);
    out.extend_from_slice(b"\r\n");
    out
}

/// Format a PONG response, echoing `message` if present.
pub fn pong(message: Option<&[u8]>) -> Vec<u8> {
    match message {
        None => b"PONG\r\n".to_vec(),
        Some(message) => {
            let mut out = Vec::with_capacity(5 + message.len() + 2);
            out.extend_from_slice(b"PONG ");
            out.extend_from_slice(message);
            out.extend_from_slice(b"\r\n");
            out
        }
    }
}

/// Format an error response.
pub fn error(reason: &str) -> Vec<u8> {
    format!("ERR {reason}\r\n").into_bytes()
}
