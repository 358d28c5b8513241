//! Frame protocol implementation.
//!
//! A length-prefixed binary protocol exposing the full messaging surface:
//!
//! ```text
//! +--------+----------------+-------------------+
//! | kind   | length (u16 BE)| payload           |
//! | 1 byte | 2 bytes        | `length` bytes    |
//! +--------+----------------+-------------------+
//! ```
//!
//! Client kinds:
//! - `0` IDENT: payload is the identifier. Acknowledged with an IDENT frame
//!   carrying the accepted id, or an empty one if it was taken.
//! - `1` ECHO: payload is sent straight back in an ECHO frame.
//! - `2` UNICAST: `id_len: u8`, id, message. The receiver gets a DELIVER frame.
//! - `3` BROADCAST: message. Every other client gets a DELIVER frame.
//! - `4` LOG: payload goes to the server log.
//!
//! Server kind `5` DELIVER carries `id_len: u8`, sender id, message.
//!
//! Any framing violation (unknown kind, oversized payload, bad address)
//! closes the connection.

pub mod handler;
pub mod parser;

pub use handler::FrameTask;
