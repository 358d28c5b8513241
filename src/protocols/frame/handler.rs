//! Frame task: binary framing plus frame handling.

use bytes::{Buf, BytesMut};
use tracing::debug;

use super::parser::{self, kind, Frame, ParseResult};
use crate::runtime::{ConnectionInterface, Feed, Task};

/// Default payload limit.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024;

/// Per-connection frame state.
pub struct FrameTask {
    buffer: BytesMut,
    max_payload: usize,
}

impl FrameTask {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(parser::HEADER_LEN + max_payload.min(4096)),
            max_payload: max_payload.min(parser::MAX_FRAME_PAYLOAD),
        }
    }
}

impl Default for FrameTask {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Task for FrameTask {
    type Unit = Frame;

    fn feed(&mut self, bytes: &[u8]) -> Feed<Frame> {
        self.buffer.extend_from_slice(bytes);
        match parser::parse(&self.buffer, self.max_payload) {
            ParseResult::Complete(frame, consumed) => {
                self.buffer.advance(consumed);
                Feed::Complete(frame)
            }
            ParseResult::Incomplete => Feed::NeedMoreData,
            ParseResult::Error(e) => Feed::Malformed(e.to_string()),
        }
    }

    fn handle(&mut self, frame: Frame, conn: &dyn ConnectionInterface) {
        match frame {
            Frame::Ident(id) => {
                conn.set_id(&id);
                // The accepted id is acknowledged; an empty one means refused
                let ack: &[u8] = if conn.id().as_deref() == Some(id.as_str()) {
                    id.as_bytes()
                } else {
                    &[]
                };
                send(conn, parser::encode(kind::IDENT, ack));
            }
            Frame::Echo(payload) => send(conn, parser::encode(kind::ECHO, &payload)),
            Frame::Unicast { to, message } => {
                let sender = conn.id().unwrap_or_default();
                if let Some(out) = parser::deliver(&sender, &message) {
                    conn.unicast(&to, &out);
                }
            }
            Frame::Broadcast(message) => {
                let sender = conn.id().unwrap_or_default();
                if let Some(out) = parser::deliver(&sender, &message) {
                    conn.broadcast(&out);
                }
            }
            Frame::Log(message) => conn.log(&message),
        }
    }
}

fn send(conn: &dyn ConnectionInterface, frame: Option<Vec<u8>>) {
    match frame {
        Some(frame) => conn.response(&frame),
        None => debug!(conn = ?conn.handle(), "Reply does not fit in a frame"),
    }
}
