//! hello-server: a fixed-response TCP server
//!
//! Accepts TCP connections and answers every non-empty request with the
//! same small HTTP response, one handler task per connection.
//!
//! Features:
//! - Bounded concurrency via a connection admission limit
//! - Per-operation read/write deadlines
//! - Graceful shutdown with a bounded drain for in-flight connections
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod protocol;
mod server;
mod shutdown;

use config::Config;
use server::Server;
use tracing::{error, info};
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
        backlog = config.backlog,
        max_connections = config.max_connections,
        read_timeout_secs = config.read_timeout_secs,
        write_timeout_secs = config.write_timeout_secs,
        "Starting hello-server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    // Runtime construction is the one dispatch-related failure that can
    // still happen; it is fatal, like any other startup error.
    let runtime = builder.build()?;

    runtime.block_on(async {
        let server = Server::bind(&config)?;
        let shutdown = server.shutdown_handle();

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received ctrl-c, shutting down");
                    shutdown.trigger();
                }
                Err(e) => error!(error = %e, "Failed to install ctrl-c handler"),
            }
        });

        server.run().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    info!("Shutdown complete");
    Ok(())
}
