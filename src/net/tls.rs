//! TLS composition.
//!
//! TLS is not implemented here, only composed: a rustls server config is
//! stored on the server and applied per accepted stream (or inline via
//! `Connection::start_tls`). The handshake itself is driven by tokio-rustls.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::ServerError;

/// Wrap an accepted stream in server-side TLS framing and drive the handshake
/// to completion.
pub(crate) async fn wrap_server(
    stream: TcpStream,
    config: Arc<rustls::ServerConfig>,
) -> io::Result<TlsStream<TcpStream>> {
    TlsAcceptor::from(config).accept(stream).await
}

/// Build a rustls server config from PEM certificate chain and private key
/// files. Convenience for binaries; library users may hand any
/// `Arc<rustls::ServerConfig>` to `Server::set_tls_config`.
pub fn server_config_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path.as_ref()).map_err(ServerError::TlsSetup)?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(ServerError::TlsSetup)?;

    let mut key_reader = BufReader::new(
        File::open(key_path.as_ref()).map_err(ServerError::TlsSetup)?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(ServerError::TlsSetup)?
        .ok_or_else(|| {
            ServerError::TlsSetup(io::Error::new(
                io::ErrorKind::InvalidData,
                "no private key found in key file",
            ))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::TlsSetup(io::Error::other(e)))?;

    Ok(Arc::new(config))
}
