//! Error types for the server.
//!
//! Errors are split by blast radius:
//! - `ServerError`: terminates the process (startup failures, poll failures,
//!   broken registry invariants).
//! - `ConnectionError`: drops a single connection; the event loop keeps going.
//! - `RegistryError`: returned by the connection registry, escalated or
//!   absorbed by the caller depending on where it happens.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Fatal server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to resolve address {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("no address found for {0}")]
    NoAddress(String),

    #[error("socket() failed: {0}")]
    Socket(io::Error),

    #[error("bind() failed on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("listen() failed: {0}")]
    Listen(io::Error),

    #[error("poll() failed: {0}")]
    Poll(io::Error),

    #[error("failed to register listener: {0}")]
    Register(io::Error),

    #[error("registry invariant violated: {0}")]
    Registry(#[from] RegistryError),
}

/// Errors that only affect one client connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed by peer")]
    Closed,

    #[error("receive failed: {0}")]
    Io(#[from] io::Error),

    #[error("request exceeds {0} bytes without a line terminator")]
    Overflow(usize),
}

/// Connection registry errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} not found")]
    NotFound(usize),

    #[error("connection limit of {0} reached")]
    Full(usize),
}
