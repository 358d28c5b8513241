//! TCP server: listener setup and the accept loop.
//!
//! Every accepted socket becomes a [`Connection`] running the configured
//! task. The server owns the [`Registry`]; connections only hold a weak
//! reference to it.

use crate::config::{Config, ProtocolType};
use crate::protocols::chat::ChatTask;
use crate::protocols::frame::FrameTask;
use crate::runtime::{Connection, ConnectionInterface, Registry, StartAction, Task};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for connections to flush and close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let registry = Registry::new(config.max_connections, config.broadcast);
        Server { config, registry }
    }

    /// Bind the configured address. Must be called inside the runtime.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let listener = create_listener(self.config.listen)?;
        TcpListener::from_std(listener)
    }

    /// Serve the configured protocol until Ctrl-C.
    pub async fn run(&self) -> io::Result<()> {
        let listener = self.bind()?;
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        };

        match self.config.protocol {
            ProtocolType::Chat => {
                let max_line = self.config.max_line;
                self.serve(listener, move || ChatTask::new(max_line), shutdown)
                    .await
            }
            ProtocolType::Frame => {
                let max_payload = self.config.max_payload;
                self.serve(listener, move || FrameTask::new(max_payload), shutdown)
                    .await
            }
        }
    }

    /// Accept connections on `listener` until `shutdown` resolves, running a
    /// fresh task from `make_task` on each.
    pub async fn serve<T, F>(
        &self,
        listener: TcpListener,
        make_task: F,
        shutdown: impl Future<Output = ()>,
    ) -> io::Result<()>
    where
        T: Task,
        F: Fn() -> T,
    {
        info!(
            address = %listener.local_addr()?,
            max_connections = self.registry.capacity(),
            "Server listening"
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer, make_task()),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn accept<T: Task>(&self, stream: TcpStream, peer: SocketAddr, task: T) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let conn = Connection::with_queue_depth(
            stream,
            Some(peer),
            task,
            Arc::downgrade(&self.registry),
            self.config.buffer_size,
            self.config.queue_depth,
        );
        match conn.attach() {
            Ok(handle) => {
                debug!(conn = handle, peer = %peer, "New connection");
                conn.start(self.start_action());
            }
            Err(e) => {
                // Dropping the connection closes the socket
                warn!(peer = %peer, error = %e, "Rejecting connection");
            }
        }
    }

    fn start_action(&self) -> StartAction {
        self.config.start_action()
    }

    /// Stop every connection and wait for them to leave the registry.
    async fn shutdown(&self) {
        info!(
            connections = self.registry.len(),
            ids = ?self.registry.ids(),
            "Shutting down"
        );
        self.registry.for_each(|_, conn| conn.stop());

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while !self.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.registry.len(),
                "Connections still open after grace period"
            );
        }
    }

    /// Get a reference to the registry for testing
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
