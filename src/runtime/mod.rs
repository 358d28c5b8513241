//! Per-connection runtime.
//!
//! - `Connection`: owns one socket and drives its read/parse/dispatch cycle
//! - `ConnectionInterface`: what tasks and the registry see of a connection
//! - `Registry`: the set of live connections, by handle and by identifier
//! - `Task`: the pluggable per-connection logic

pub mod connection;
pub mod interface;
pub mod registry;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{
    ConnState, Connection, StartAction, Transport, DEFAULT_BUFFER_SIZE, DEFAULT_QUEUE_DEPTH,
};
pub use interface::ConnectionInterface;
pub use registry::{BroadcastPolicy, Handle, LogSink, Registry, RegistryError};
pub use task::{Feed, Task};
