//! Error types for the server kernel.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by server construction, configuration and serving.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address string did not resolve.
    #[error("invalid listen address '{addr}': {source}")]
    AddrInvalid {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Binding or listening on the resolved address failed.
    #[error("failed to listen on {addr}: {source}")]
    ListenFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A socket option could not be applied to the listen socket.
    #[error("unable to set {option} option: {source}")]
    SockOpt {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    /// TLS was requested but no TLS configuration is set.
    #[error("no valid TLS config given")]
    TlsConfigMissing,

    /// `serve` was called before `listen` produced a listener.
    #[error("no valid listener found; call listen() or listen_tls() first")]
    NoListener,

    /// An accept failure that is neither a timeout nor a transient condition.
    #[error("accept failed: {0}")]
    AcceptFatal(#[source] io::Error),

    /// Loading certificates or keys for a TLS configuration failed.
    #[error("TLS setup failed: {0}")]
    TlsSetup(#[source] io::Error),
}
