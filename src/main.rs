//! switchboard: a multi-client TCP message switch
//!
//! Every client connection runs a pluggable task that parses the incoming
//! byte stream and can talk back to:
//! - its own client (response)
//! - one other client by identifier (unicast)
//! - every connected client (broadcast)
//!
//! Bundled tasks:
//! - `chat`: line-based text protocol
//! - `frame`: length-prefixed binary protocol
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod protocols;
mod runtime;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        protocol = ?config.protocol,
        workers = ?config.workers,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        start = ?config.start,
        broadcast = ?config.broadcast,
        "Starting switchboard server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.thread_name("switchboard-worker").enable_all().build()?;

    let server = Server::new(config);
    runtime.block_on(server.run())?;

    info!("Server stopped");
    Ok(())
}
