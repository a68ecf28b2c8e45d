//! email-intake: a single-threaded line-oriented TCP server
//!
//! Every client is greeted with `220` and may then send `topic:value\r\n`
//! records. The `email` topic is stored per connection.
//!
//! Features:
//! - One thread multiplexing the listener and all clients (epoll/kqueue)
//! - Records split across any number of reads
//! - Bounded per-connection buffers
//! - Configuration via CLI arguments or TOML file, with a port prompt fallback

mod config;
mod error;
mod protocols;
mod runtime;

use config::Config;
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

    let port = config.resolve_port()?;

    info!(
        host = %config.host,
        port,
        backlog = config.backlog,
        max_connections = config.max_connections,
        max_request_size = config.max_request_size,
        "Starting email-intake server"
    );

    if let Err(e) = runtime::run(&config, port) {
        error!(error = %e, "Fatal error, shutting down");
        return Err(e.into());
    }

    Ok(())
}
