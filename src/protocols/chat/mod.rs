//! Chat protocol implementation.
//!
//! A line-based text protocol for talking to other connected clients:
//!
//! ```text
//! NICK <id>            pick an identifier         -> OK | ERR id taken
//! MSG <id> <text>      send to one client         -> (receiver gets FROM <sender> <text>)
//! ALL <text>           send to everyone else      -> (each gets FROM <sender> <text>)
//! PING [text]          liveness check             -> PONG [text]
//! QUIT                 close the connection       -> OK
//! ```
//!
//! Lines end in `\n`, optionally preceded by `\r`. An invalid command gets an
//! `ERR <reason>` reply and the session continues. A line longer than the
//! configured limit cannot be resynchronised and closes the connection.

pub mod handler;
pub mod parser;

pub use handler::ChatTask;
