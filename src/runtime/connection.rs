//! Connection state machine for a single client socket.
//!
//! A connection drives a chain of asynchronous operations:
//!
//! ```text
//! Created -> Reading -> Parsing -> Dispatching -> Reading -> ...
//!                          |            |
//!                          +------------+--> Disconnecting -> Closed
//! ```
//!
//! Every issued operation is a spawned tokio task holding a strong
//! reference to the connection, so the connection outlives anything it has
//! in flight. The connection keeps a weak reference to itself to mint those
//! strong references from `&self`.
//!
//! The socket's read half and the receive buffer live together in a single
//! slot. A read takes the slot out and the completion puts it back, so a
//! second read cannot be issued while one is outstanding.
//!
//! Writes go through an unbounded queue drained by one writer task per
//! connection, which keeps them in call order without blocking the caller.

use crate::runtime::interface::ConnectionInterface;
use crate::runtime::registry::{Handle, Registry, RegistryError};
use crate::runtime::task::{Feed, Task};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Default capacity of the receive buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default number of writes a connection may have queued. A peer that lets
/// its queue fill up is disconnected.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// How long queued writes may take to drain once a connection has closed.
const FLUSH_DEADLINE: Duration = Duration::from_millis(500);

/// Byte stream a connection can own.
pub trait Transport: AsyncRead + AsyncWrite + Send + 'static {}

impl<S: AsyncRead + AsyncWrite + Send + 'static> Transport for S {}

/// Current life-cycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed, not yet started.
    Created,
    /// A read is outstanding, or about to be issued.
    Reading,
    /// Feeding received bytes to the task.
    Parsing,
    /// The task is handling a complete unit.
    Dispatching,
    /// Tearing down.
    Disconnecting,
    /// Socket released and detached from the registry.
    Closed,
}

impl ConnState {
    fn is_terminal(self) -> bool {
        matches!(self, ConnState::Disconnecting | ConnState::Closed)
    }
}

/// What a connection does when it is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartAction {
    /// Begin reading immediately.
    Read,
    /// Write a greeting to the peer, then begin reading once it is sent.
    Greet(Bytes),
}

struct ReadSlot<S> {
    reader: ReadHalf<S>,
    buffer: Box<[u8]>,
}

struct Outbound {
    bytes: Bytes,
    /// Set when someone waits for this write instead of ignoring it.
    done: Option<oneshot::Sender<io::Result<()>>>,
}

type WriterParts<S> = (WriteHalf<S>, mpsc::Receiver<Outbound>);

/// A single client connection running task `T` over transport `S`.
pub struct Connection<T: Task, S: Transport> {
    this: Weak<Self>,
    handle: OnceLock<Handle>,
    peer: Option<SocketAddr>,
    id: Mutex<Option<String>>,
    task: Mutex<T>,
    read_slot: Mutex<Option<ReadSlot<S>>>,
    /// Taken by the writer task on start.
    writer: Mutex<Option<WriterParts<S>>>,
    /// Dropped on disconnect or overflow, which lets the writer drain and
    /// shut down.
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    state: watch::Sender<ConnState>,
    stopping: watch::Sender<bool>,
    registry: Weak<Registry>,
}

impl<T: Task, S: Transport> Connection<T, S> {
    /// Create a connection in the `Created` state.
    pub fn new(
        stream: S,
        peer: Option<SocketAddr>,
        task: T,
        registry: Weak<Registry>,
        buffer_size: usize,
    ) -> Arc<Self> {
        Self::with_queue_depth(stream, peer, task, registry, buffer_size, DEFAULT_QUEUE_DEPTH)
    }

    /// Like [`Connection::new`], with at most `queue_depth` writes queued.
    pub fn with_queue_depth(
        stream: S,
        peer: Option<SocketAddr>,
        task: T,
        registry: Weak<Registry>,
        buffer_size: usize,
        queue_depth: usize,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(queue_depth.max(1));

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            handle: OnceLock::new(),
            peer,
            id: Mutex::new(None),
            task: Mutex::new(task),
            read_slot: Mutex::new(Some(ReadSlot {
                reader,
                buffer: vec![0; buffer_size.max(1)].into_boxed_slice(),
            })),
            writer: Mutex::new(Some((writer, rx))),
            outbound: Mutex::new(Some(tx)),
            state: watch::Sender::new(ConnState::Created),
            stopping: watch::Sender::new(false),
            registry,
        })
    }

    /// Insert this connection into its registry and remember the handle.
    pub fn attach(self: &Arc<Self>) -> Result<Handle, RegistryError> {
        if let Some(handle) = self.handle() {
            return Err(RegistryError::AlreadyAttached(handle));
        }
        let registry = self.registry.upgrade().ok_or(RegistryError::Gone)?;
        let handle = registry.attach(self.clone())?;
        if self.handle.set(handle).is_err() {
            // A concurrent attach won; only its slot is released on disconnect
            registry.unregister(handle);
            return Err(RegistryError::AlreadyAttached(
                self.handle().unwrap_or(handle),
            ));
        }
        Ok(handle)
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Start the connection. Only the first call on a fresh connection has
    /// any effect.
    pub fn start(&self, action: StartAction) {
        let started = self.state.send_if_modified(|state| {
            if *state == ConnState::Created {
                *state = ConnState::Reading;
                true
            } else {
                false
            }
        });
        if !started {
            trace!(conn = ?self.handle(), "Ignoring start on a started connection");
            return;
        }

        debug!(conn = ?self.handle(), peer = ?self.peer, ?action, "Starting connection");
        self.spawn_writer();

        match action {
            StartAction::Read => {
                self.task.lock().on_connect(self);
                self.issue_read();
            }
            StartAction::Greet(greeting) => {
                let (done_tx, done_rx) = oneshot::channel();
                self.enqueue(greeting, Some(done_tx));
                self.task.lock().on_connect(self);

                let Some(this) = self.this.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let result = done_rx.await.unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer closed"))
                    });
                    this.start_again(result);
                });
            }
        }
    }

    /// Request an orderly shutdown. Idempotent.
    ///
    /// An outstanding read is interrupted and routes to `disconnect` through
    /// its normal completion path. A dispatch in progress finishes the
    /// current unit and disconnects instead of reading again.
    pub fn stop(&self) {
        let first = self
            .stopping
            .send_if_modified(|stopping| !std::mem::replace(stopping, true));
        if !first {
            return;
        }

        debug!(conn = ?self.handle(), state = ?self.state(), "Stop requested");
        if self.state() == ConnState::Created {
            self.disconnect();
        }
    }

    /// Release the socket and leave the registry. Terminal.
    pub fn disconnect(&self) {
        let first = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ConnState::Disconnecting;
                true
            }
        });
        if !first {
            return;
        }

        self.stopping.send_replace(true);
        // The writer gets `FLUSH_DEADLINE` to drain pending writes
        drop(self.outbound.lock().take());
        drop(self.read_slot.lock().take());
        drop(self.writer.lock().take());

        if let (Some(registry), Some(handle)) = (self.registry.upgrade(), self.handle()) {
            registry.unregister(handle);
        }

        self.state.send_replace(ConnState::Closed);
        info!(
            conn = ?self.handle(),
            id = self.id().as_deref().unwrap_or("-"),
            peer = ?self.peer,
            "Connection closed"
        );
    }

    /// Completion handler for writes whose outcome nobody waits for.
    pub fn do_nothing(&self, result: &io::Result<()>) {
        if let Err(e) = result {
            trace!(conn = ?self.handle(), error = %e, "Ignored write result");
        }
    }

    /// Wait until the connection reaches `Closed`.
    #[cfg(test)]
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ConnState::Closed).await;
    }

    fn stop_requested(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Move to `next` unless the connection is already tearing down.
    fn transition(&self, next: ConnState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    /// Issue one read into the receive buffer. Returns whether a read was
    /// actually issued.
    fn issue_read(&self) -> bool {
        if self.stop_requested() {
            self.disconnect();
            return false;
        }

        let Some(mut slot) = self.read_slot.lock().take() else {
            trace!(conn = ?self.handle(), "Read already outstanding");
            return false;
        };
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        if !self.transition(ConnState::Reading) {
            return false;
        }

        tokio::spawn(async move {
            let mut stopping = this.stopping.subscribe();
            let result = tokio::select! {
                biased;
                _ = stopping.wait_for(|stopping| *stopping) => Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "connection stopped",
                )),
                result = slot.reader.read(&mut slot.buffer) => result,
            };
            this.parse(slot, result);
        });
        true
    }

    /// Completion of a read: feed the bytes to the task and act on the
    /// outcome.
    fn parse(&self, slot: ReadSlot<S>, result: io::Result<usize>) {
        let bytes_transferred = match result {
            Ok(0) => {
                debug!(conn = ?self.handle(), "Connection closed by peer");
                return self.disconnect();
            }
            Ok(n) => n,
            Err(e) => {
                if e.kind() == io::ErrorKind::Interrupted {
                    debug!(conn = ?self.handle(), "Read cancelled");
                } else {
                    warn!(conn = ?self.handle(), error = %e, "Read failed");
                }
                return self.disconnect();
            }
        };

        if !self.transition(ConnState::Parsing) {
            return;
        }
        trace!(conn = ?self.handle(), bytes = bytes_transferred, "Parsing");

        let outcome = self.task.lock().feed(&slot.buffer[..bytes_transferred]);
        *self.read_slot.lock() = Some(slot);

        match outcome {
            Feed::Complete(unit) => self.process(unit),
            Feed::NeedMoreData => self.start_again(Ok(())),
            Feed::Malformed(reason) => self.parse_error(&reason),
        }
    }

    /// Hand complete units to the task until it has none buffered, then
    /// read again.
    fn process(&self, mut unit: T::Unit) {
        loop {
            if !self.transition(ConnState::Dispatching) {
                return;
            }

            let next = {
                let mut task = self.task.lock();
                task.handle(unit, self);
                if self.stop_requested() {
                    None
                } else {
                    Some(task.feed(&[]))
                }
            };

            match next {
                None => return self.disconnect(),
                Some(Feed::Complete(more)) => unit = more,
                Some(Feed::NeedMoreData) => return self.start_again(Ok(())),
                Some(Feed::Malformed(reason)) => return self.parse_error(&reason),
            }
        }
    }

    /// Malformed input is fatal: log it once and disconnect.
    fn parse_error(&self, reason: &str) {
        warn!(conn = ?self.handle(), reason, "Malformed input");
        self.log(format!("malformed input: {reason}").as_bytes());
        self.disconnect();
    }

    /// Re-enter the read state without dispatching, after a partial frame
    /// or a completed greeting.
    fn start_again(&self, result: io::Result<()>) {
        match result {
            Ok(()) => {
                self.issue_read();
            }
            Err(e) => {
                debug!(conn = ?self.handle(), error = %e, "Cannot continue");
                self.disconnect();
            }
        }
    }

    fn enqueue(&self, bytes: Bytes, done: Option<oneshot::Sender<io::Result<()>>>) {
        let mut guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            trace!(conn = ?self.handle(), "Dropping write on closed connection");
            return;
        };
        match tx.try_send(Outbound { bytes, done }) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => trace!(conn = ?self.handle(), "Writer gone"),
            Err(TrySendError::Full(_)) => {
                // No further writes are accepted; the writer drains what it has
                guard.take();
                drop(guard);
                self.overflowed();
            }
        }
    }

    /// The peer is not draining its queue. Teardown runs on its own task
    /// since callers may hold the registry lock.
    fn overflowed(&self) {
        warn!(conn = ?self.handle(), "Outbound queue full, disconnecting");
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            this.log(b"outbound queue full, disconnecting slow peer");
            this.disconnect();
        });
    }

    /// Resolves `FLUSH_DEADLINE` after the connection has closed.
    async fn flush_deadline(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == ConnState::Closed).await;
        tokio::time::sleep(FLUSH_DEADLINE).await;
    }

    fn spawn_writer(&self) {
        let Some((mut writer, mut rx)) = self.writer.lock().take() else {
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            // A peer that stops reading must not pin the socket open
            let deadline = this.flush_deadline();
            tokio::pin!(deadline);

            while let Some(Outbound { bytes, done }) = rx.recv().await {
                let result = tokio::select! {
                    result = writer.write_all(&bytes) => result,
                    _ = &mut deadline => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "flush deadline passed",
                    )),
                };
                let failed = match &result {
                    Err(e) => {
                        debug!(conn = ?this.handle(), error = %e, "Write failed");
                        true
                    }
                    Ok(()) => false,
                };
                match done {
                    Some(done) => {
                        let _ = done.send(result);
                    }
                    None => this.do_nothing(&result),
                }
                if failed {
                    this.disconnect();
                    return;
                }
            }
            let _ = tokio::time::timeout(FLUSH_DEADLINE, writer.shutdown()).await;
        });
    }
}

impl<T: Task, S: Transport> ConnectionInterface for Connection<T, S> {
    fn handle(&self) -> Option<Handle> {
        self.handle.get().copied()
    }

    fn set_id(&self, id: &str) {
        match (self.registry.upgrade(), self.handle()) {
            (Some(registry), Some(handle)) => match registry.register(id, handle) {
                Ok(()) => *self.id.lock() = Some(id.to_owned()),
                Err(e) => {
                    let current = self.id();
                    registry.log(Some(handle), current.as_deref(), e.to_string().as_bytes());
                }
            },
            _ => *self.id.lock() = Some(id.to_owned()),
        }
    }

    fn id(&self) -> Option<String> {
        self.id.lock().clone()
    }

    fn read(&self) {
        match self.state() {
            // The pipeline re-arms the read itself when the cycle ends
            ConnState::Parsing | ConnState::Dispatching => {
                trace!(conn = ?self.handle(), "Read coalesced with current cycle");
            }
            ConnState::Disconnecting | ConnState::Closed => {}
            ConnState::Created | ConnState::Reading => {
                self.issue_read();
            }
        }
    }

    fn response(&self, message: &[u8]) {
        self.enqueue(Bytes::copy_from_slice(message), None);
    }

    fn unicast(&self, receiver_id: &str, message: &[u8]) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match registry.lookup(receiver_id) {
            Some(receiver) => receiver.response(message),
            None => {
                let note = format!("unicast to unknown receiver '{receiver_id}' dropped");
                registry.log(self.handle(), self.id().as_deref(), note.as_bytes());
            }
        }
    }

    fn broadcast(&self, message: &[u8]) {
        if let Some(registry) = self.registry.upgrade() {
            let delivered = registry.broadcast(self.handle(), message);
            trace!(conn = ?self.handle(), delivered, "Broadcast");
        }
    }

    fn log(&self, message: &[u8]) {
        match self.registry.upgrade() {
            Some(registry) => registry.log(self.handle(), self.id().as_deref(), message),
            None => debug!(
                conn = ?self.handle(),
                "{}",
                String::from_utf8_lossy(message).trim_end()
            ),
        }
    }

    fn stop(&self) {
        Connection::stop(self);
    }
}
