//! Type-erased view of a connection.
//!
//! Tasks and the registry only ever see a connection through this trait,
//! which keeps them independent of the connection's task and transport
//! type parameters.

use crate::runtime::registry::Handle;

/// Messaging and addressing surface of a live connection.
///
/// None of these methods block or fail: writes are queued, routing misses
/// are reported through the log sink, and calls on a closed connection are
/// ignored.
pub trait ConnectionInterface: Send + Sync {
    /// Arena handle assigned when the connection was attached.
    fn handle(&self) -> Option<Handle>;

    /// Assign the registry identifier for this connection.
    fn set_id(&self, id: &str);

    /// Registry identifier, if one has been assigned.
    fn id(&self) -> Option<String>;

    /// Issue the next read, unless one is already outstanding.
    fn read(&self);

    /// Send `message` to this connection's own peer.
    fn response(&self, message: &[u8]);

    /// Send `message` to the connection registered as `receiver_id`.
    fn unicast(&self, receiver_id: &str, message: &[u8]);

    /// Send `message` to every registered connection.
    fn broadcast(&self, message: &[u8]);

    /// Emit a diagnostic through the registry's log sink.
    fn log(&self, message: &[u8]);

    /// Request an orderly close.
    fn stop(&self);
}
