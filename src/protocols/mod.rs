//! Task implementations.
//!
//! Each protocol has a parser module and a handler module implementing
//! [`Task`](crate::runtime::Task):
//! - `chat`: line-based text protocol for people and scripts
//! - `frame`: length-prefixed binary protocol for programs

pub mod chat;
pub mod frame;

/// Longest identifier a client may pick.
pub const MAX_ID_LEN: usize = 32;

/// Validate a client-chosen identifier: 1 to 32 printable ASCII
/// characters, no spaces.
pub fn parse_id(raw: &[u8]) -> Option<String> {
    if raw.is_empty() || raw.len() > MAX_ID_LEN || !raw.iter().all(u8::is_ascii_graphic) {
        return None;
    }
    String::from_utf8(raw.to_vec()).ok()
}
