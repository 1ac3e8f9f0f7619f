//! Listener factory.
//!
//! # Responsibilities
//! - Resolve the textual `host:port` to a socket address
//! - Select the IPv4/IPv6 socket family from the resolved address
//! - Apply kernel socket options before `listen(2)`
//! - Hand back a tokio listener shared by all accept loops

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::config::ListenConfig;
use crate::error::ServerError;

/// Backlog passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// Resolve `addr` (`host:port`; host may be numeric IPv4, bracketed IPv6 or a
/// DNS name) to the first usable socket address.
pub(crate) async fn resolve_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let mut candidates =
        tokio::net::lookup_host(addr)
            .await
            .map_err(|source| ServerError::AddrInvalid {
                addr: addr.to_string(),
                source,
            })?;

    candidates.next().ok_or_else(|| ServerError::AddrInvalid {
        addr: addr.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
    })
}

/// Bind a listener on `addr` with the options from `config` applied between
/// `bind` and `listen`.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    config: &ListenConfig,
) -> Result<TcpListener, ServerError> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| ServerError::ListenFailed { addr, source })?;

    socket
        .set_reuse_address(true)
        .map_err(|source| ServerError::ListenFailed { addr, source })?;

    socket
        .set_nonblocking(true)
        .map_err(|source| ServerError::ListenFailed { addr, source })?;

    socket
        .bind(&addr.into())
        .map_err(|source| ServerError::ListenFailed { addr, source })?;

    super::sockopt::apply(&socket, config)?;

    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| ServerError::ListenFailed { addr, source })?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)
        .map_err(|source| ServerError::ListenFailed { addr, source })?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::ListenFailed { addr, source })?;

    tracing::info!(
        address = %local_addr,
        reuse_port = config.reuse_port,
        fast_open = config.fast_open,
        defer_accept = config.defer_accept,
        "Listener bound"
    );

    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_numeric_addresses() {
        let addr = resolve_addr("127.0.0.1:4242").await.unwrap();
        assert_eq!(addr.port(), 4242);
        assert!(addr.is_ipv4());

        let addr = resolve_addr("[::1]:4242").await.unwrap();
        assert!(addr.is_ipv6());
    }

    #[tokio::test]
    async fn rejects_unresolvable_addresses() {
        let err = resolve_addr("definitely-not-a-host.invalid:80")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AddrInvalid { .. }));
    }

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let addr = resolve_addr("127.0.0.1:0").await.unwrap();
        let listener = bind_listener(addr, &ListenConfig::default()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn binds_ipv6_family() {
        let addr = resolve_addr("[::1]:0").await.unwrap();
        let listener = bind_listener(addr, &ListenConfig::default()).unwrap();
        assert!(listener.local_addr().unwrap().is_ipv6());
    }
}
