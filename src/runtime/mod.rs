//! Single-threaded networking runtime.
//!
//! - `listener`: resolve, bind and listen
//! - `connection`: per-client buffering and the connection registry
//! - `mio`: readiness-based event loop (epoll on Linux, kqueue on macOS)

mod connection;
mod listener;
mod mio;

use self::listener::create_listener;
use self::mio::EventLoop;
use crate::config::Config;
use crate::error::ServerError;
use tracing::info;

/// Bind the listener and run the event loop forever.
///
/// Only returns on a fatal error.
pub fn run(config: &Config, port: u16) -> Result<(), ServerError> {
    let listener = create_listener(&config.host, port, config.backlog)?;
    let mut event_loop = EventLoop::new(listener, config)?;

    if let Ok(addr) = event_loop.local_addr() {
        info!(address = %addr, "Accepting connections");
    }

    event_loop.run()
}
