//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tcpserve::{Connection, Server};

/// Build a server on an ephemeral loopback port with an echo handler.
pub async fn echo_server() -> Server {
    let server = Server::new("127.0.0.1:0").await.expect("resolve loopback");
    set_echo_handler(&server);
    server
}

/// Install a handler that copies input to output until EOF.
pub fn set_echo_handler(server: &Server) {
    server.set_request_handler(|conn: &mut dyn Connection| {
        Box::pin(async move {
            let mut buf = [0u8; 4096];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    });
}

/// Connect, send `payload`, half-close, and read everything echoed back.
pub async fn send_and_collect(addr: std::net::SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(payload).await.expect("write");
    stream.shutdown().await.expect("half-close");

    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.expect("read echo");
    echoed
}

/// Poll `cond` every 10 ms until it holds or `deadline` elapses.
pub async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Self-signed cert for `localhost`: a server config plus a client config
/// that trusts it.
pub fn self_signed_tls() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("generate cert");

    let cert_der = cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der.into())
        .expect("server config");

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).expect("trust cert");
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(server_config), Arc::new(client_config))
}
