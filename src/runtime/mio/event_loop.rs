//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! mio readiness is edge-triggered, so every readiness event is drained:
//! the listener accepts until it would block and each client is read until
//! it would block. If accepting stops on an error (e.g. EMFILE) the backlog
//! may still hold connections that will never raise a new event, so the
//! listener is retried on the following turns until it drains.

use crate::config::Config;
use crate::error::{ConnectionError, ServerError};
use crate::protocols::topic::GREETING;
use crate::runtime::connection::{Connection, ConnectionRegistry, Limits};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Longest wait before retrying a listener that stopped on an accept error.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Sources found ready by one poll, in dispatch order.
#[derive(Debug, Default)]
struct ReadySet {
    listener: bool,
    connections: Vec<usize>,
}

impl ReadySet {
    fn clear(&mut self) {
        self.listener = false;
        self.connections.clear();
    }
}

/// Single-threaded server loop owning the listener and every connection.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    ready: ReadySet,
    listener: TcpListener,
    /// Accept stopped on an error; the backlog may not be empty.
    accept_pending: bool,
    connections: ConnectionRegistry<TcpStream>,
    limits: Limits,
}

impl EventLoop {
    /// Register `listener` with a new poller.
    pub fn new(listener: std::net::TcpListener, config: &Config) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(ServerError::Poll)?;

        listener.set_nonblocking(true).map_err(ServerError::Register)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Register)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.batch_size),
            ready: ReadySet::default(),
            listener,
            accept_pending: false,
            connections: ConnectionRegistry::new(config.max_connections),
            limits: Limits {
                max_request_size: config.max_request_size,
                max_email_len: config.max_email_len,
            },
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Live connections.
    #[allow(dead_code)]
    pub fn connections(&self) -> &ConnectionRegistry<TcpStream> {
        &self.connections
    }

    /// Run until a fatal error occurs.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(
            max_connections = ?self.connections.capacity(),
            max_request_size = self.limits.max_request_size,
            "Event loop started"
        );

        loop {
            self.turn(None)?;
        }
    }

    /// One iteration: wait for readiness, then accept and read.
    ///
    /// The listener is serviced before any client.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<(), ServerError> {
        let timeout = if self.accept_pending {
            Some(timeout.map_or(ACCEPT_RETRY, |t| t.min(ACCEPT_RETRY)))
        } else {
            timeout
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(ServerError::Poll(e)),
        }

        self.ready.clear();
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.ready.listener = true,
                // Closed and errored sockets are read too, to observe the EOF or error
                Token(conn_id) => self.ready.connections.push(conn_id),
            }
        }

        if self.ready.listener || self.accept_pending {
            self.accept_connections();
        }

        let ready = std::mem::take(&mut self.ready.connections);
        for &conn_id in &ready {
            self.handle_readable(conn_id)?;
        }
        self.ready.connections = ready;

        Ok(())
    }

    fn accept_connections(&mut self) {
        self.accept_pending = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.on_accept(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept() failed, retrying on next turn");
                    self.accept_pending = true;
                    break;
                }
            }
        }
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let limits = self.limits;
        let (conn_id, conn) = match self
            .connections
            .get_or_create(None, || Connection::new(stream, peer, limits))
        {
            Ok(entry) => entry,
            Err(e) => {
                // The stream was never moved into the registry and closes here
                warn!(peer = %peer, error = %e, "Rejecting connection");
                return;
            }
        };

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
        {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            self.discard(conn_id);
            return;
        }

        if let Err(e) = conn.stream.write_all(GREETING) {
            warn!(conn_id, peer = %peer, error = %e, "Failed to send greeting");
            self.close_connection(conn_id);
            return;
        }

        info!(conn_id, peer = %peer, "New connection");
    }

    fn handle_readable(&mut self, conn_id: usize) -> Result<(), ServerError> {
        // Stale event for a connection dropped earlier in this iteration
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return Ok(()),
        };

        let peer = conn.peer;
        match conn.read_available() {
            Ok(n) => {
                debug!(conn_id, bytes = n, buffered = conn.received(), "Read");
                Ok(())
            }
            Err(e) => {
                match e {
                    ConnectionError::Closed => {
                        info!(conn_id, peer = %peer, "Unexpected disconnect");
                    }
                    ConnectionError::Io(ref e) => {
                        warn!(conn_id, peer = %peer, error = %e, "Receive failed");
                    }
                    ConnectionError::Overflow(limit) => {
                        warn!(conn_id, peer = %peer, limit, "Request too large, dropping connection");
                    }
                }
                self.drop_connection(conn_id)
            }
        }
    }

    /// Deregister, remove and close a connection.
    fn drop_connection(&mut self, conn_id: usize) -> Result<(), ServerError> {
        let mut conn = self.connections.remove(conn_id)?;
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            debug!(conn_id, error = %e, "Deregister failed");
        }
        debug!(conn_id, peer = %conn.peer, email = ?conn.email(), "Connection closed");
        Ok(())
    }

    /// Drop a connection during accept, where the id was just handed out.
    fn close_connection(&mut self, conn_id: usize) {
        if let Err(e) = self.drop_connection(conn_id) {
            error!(conn_id, error = %e, "Failed to drop connection");
        }
    }

    /// Remove a connection that never made it into the poller.
    fn discard(&mut self, conn_id: usize) {
        if let Err(e) = self.connections.remove(conn_id) {
            error!(conn_id, error = %e, "Failed to discard connection");
        }
    }
}
