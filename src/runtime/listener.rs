//! Listening socket setup.

use crate::error::ServerError;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use tracing::info;

/// Resolve `host:port`, then bind and listen on the first address found.
///
/// The returned listener is non-blocking, ready to be handed to the poller.
pub fn create_listener(host: &str, port: u16, backlog: i32) -> Result<TcpListener, ServerError> {
    info!("Configuring server address");
    let addr = resolve(host, port)?;
    info!(address = %addr.ip(), port = addr.port(), "Server address resolved");

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(ServerError::Socket)?;

    if addr.is_ipv6() {
        socket.set_only_v6(false).map_err(ServerError::Socket)?;
    }
    socket.set_reuse_address(true).map_err(ServerError::Socket)?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|source| ServerError::Bind { addr, source })?;

    socket.listen(backlog).map_err(ServerError::Listen)?;
    info!(backlog, "Listening");

    Ok(socket.into())
}

/// Family-neutral address resolution.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let target = format!("{host}:{port}");
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ServerError::Resolve {
            addr: target.clone(),
            source,
        })?;
    addrs.next().ok_or(ServerError::NoAddress(target))
}
