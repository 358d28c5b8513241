//! Per-connection task contract.
//!
//! A task owns the framing and application semantics of one connection.
//! The connection hands it raw bytes as they arrive and, for every complete
//! unit the task reports, calls back into it with a handle to the
//! connection's messaging surface.

use crate::runtime::interface::ConnectionInterface;

/// Outcome of feeding bytes to a task's incremental parser.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed<U> {
    /// No complete unit buffered yet; read more.
    NeedMoreData,
    /// One complete unit, in stream order.
    Complete(U),
    /// The stream cannot be parsed any further. Fatal for the connection.
    Malformed(String),
}

/// Pluggable per-connection logic.
///
/// `feed` is incremental: the task keeps any partial input between calls.
/// Calling `feed` with an empty slice asks for a unit that is already
/// buffered, so the connection can drain several units that arrived in a
/// single read before issuing the next one.
pub trait Task: Send + 'static {
    /// One logical message extracted from the byte stream.
    type Unit: Send;

    /// Append `bytes` to the parse state and report the next unit, if any.
    fn feed(&mut self, bytes: &[u8]) -> Feed<Self::Unit>;

    /// Application-level handling of one unit.
    fn handle(&mut self, unit: Self::Unit, conn: &dyn ConnectionInterface);

    /// Called once when the connection starts, before the first read.
    fn on_connect(&mut self, _conn: &dyn ConnectionInterface) {}
}
