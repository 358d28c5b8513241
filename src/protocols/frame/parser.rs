//! Frame protocol parser and encoder.

use bytes::Bytes;
use thiserror::Error;

use crate::protocols::parse_id;

/// Size of the frame header: kind (1 byte) + payload length (2 bytes, BE).
pub const HEADER_LEN: usize = 3;

/// Largest payload the length field can express.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frame kind byte.
pub mod kind {
    pub const IDENT: u8 = 0;
    pub const ECHO: u8 = 1;
    pub const UNICAST: u8 = 2;
    pub const BROADCAST: u8 = 3;
    pub const LOG: u8 = 4;
    /// Server to client only.
    pub const DELIVER: u8 = 5;
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ident(String),
    Echo(Bytes),
    Unicast { to: String, message: Bytes },
    Broadcast(Bytes),
    Log(Bytes),
}

/// Framing violations. All of them are fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unexpected frame kind {0}")]
    UnexpectedKind(u8),
    #[error("payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("invalid identifier")]
    BadIdent,
    #[error("truncated unicast address")]
    BadUnicast,
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Frame with bytes consumed (header plus payload).
    Complete(Frame, usize),
    /// Header or payload not fully received yet.
    Incomplete,
    Error(FrameError),
}

/// Parse one frame from the front of `input`.
///
/// The declared length is checked against `max_payload` as soon as the
/// header is available, before any payload is buffered.
pub fn parse(input: &[u8], max_payload: usize) -> ParseResult {
    if input.len() < HEADER_LEN {
        return ParseResult::Incomplete;
    }

    let frame_kind = input[0];
    let len = u16::from_be_bytes([input[1], input[2]]) as usize;
    if len > max_payload {
        return ParseResult::Error(FrameError::TooLarge {
            len,
            max: max_payload,
        });
    }
    if frame_kind > kind::LOG {
        return ParseResult::Error(FrameError::UnexpectedKind(frame_kind));
    }

    let total = HEADER_LEN + len;
    if input.len() < total {
        return ParseResult::Incomplete;
    }

    match decode(frame_kind, &input[HEADER_LEN..total]) {
        Ok(frame) => ParseResult::Complete(frame, total),
        Err(e) => ParseResult::Error(e),
    }
}

fn decode(frame_kind: u8, payload: &[u8]) -> Result<Frame, FrameError> {
    match frame_kind {
        kind::IDENT => parse_id(payload)
            .map(Frame::Ident)
            .ok_or(FrameError::BadIdent),
        kind::ECHO => Ok(Frame::Echo(Bytes::copy_from_slice(payload))),
        kind::UNICAST => {
            let (&id_len, rest) = payload.split_first().ok_or(FrameError::BadUnicast)?;
            let id_len = id_len as usize;
            if rest.len() < id_len {
                return Err(FrameError::BadUnicast);
            }
            let to = parse_id(&rest[..id_len]).ok_or(FrameError::BadIdent)?;
            Ok(Frame::Unicast {
                to,
                message: Bytes::copy_from_slice(&rest[id_len..]),
            })
        }
        kind::BROADCAST => Ok(Frame::Broadcast(Bytes::copy_from_slice(payload))),
        kind::LOG => Ok(Frame::Log(Bytes::copy_from_slice(payload))),
        other => Err(FrameError::UnexpectedKind(other)),
    }
}

/// Encode a frame. Returns `None` if the payload does not fit the length
/// field.
pub fn encode(frame_kind: u8, payload: &[u8]) -> Option<Vec<u8>> {
    let len = u16::try_from(payload.len()).ok()?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(frame_kind);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Some(out)
}

/// Encode a DELIVER frame carrying `message` from `sender`.
pub fn deliver(sender: &str, message: &[u8]) -> Option<Vec<u8>> {
    let id_len = u8::try_from(sender.len()).ok()?;
    let mut payload = Vec::with_capacity(1 + sender.len() + message.len());
    payload.push(id_len);
    payload.extend_from_slice(sender.as_bytes());
    payload.extend_from_slice(message);
    encode(kind::DELIVER, &payload)
}

/// Encode a UNICAST request frame, as a client would send it.
#[cfg(test)]
pub fn unicast(to: &str, message: &[u8]) -> Vec<u8> {
    let mut payload = vec![to.len() as u8];
    payload.extend_from_slice(to.as_bytes());
    payload.extend_from_slice(message);
    encode(kind::UNICAST, &payload).unwrap()
}
