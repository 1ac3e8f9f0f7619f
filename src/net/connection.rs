//! Connection objects handed to request handlers.
//!
//! # Responsibilities
//! - Forward read/write/close and address lookups to the underlying stream
//! - Track the connection start timestamp and optional user context
//! - Enforce per-connection read/write timeouts inside the poll path
//! - Upgrade the stream to TLS inline (`start_tls`)
//!
//! The `Connection` trait is the capability set the server core dispatches
//! on; `TcpConnection` is the default variant produced by the built-in
//! connection factory. Objects are recycled through the connection pool, so
//! identity is not stable across requests and handlers must not retain a
//! connection past return.

use std::any::Any;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::server::TlsStream;

use crate::error::ServerError;
use crate::server::{Server, WeakServer};

/// Opaque user context attached to a server or a single connection.
pub type Context = Arc<dyn Any + Send + Sync>;

/// Boxed future returned by trait methods that must stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability set of a pooled connection object.
///
/// The server core drives the lifecycle: `reset` binds a freshly accepted
/// stream, `start` stamps the start time just before dispatch, `clear` strips
/// stream and context when the object goes back to the pool.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {
    /// Bind a freshly accepted stream to this object.
    fn reset(&mut self, stream: TcpStream);

    /// Stamp the connection start timestamp.
    fn start(&mut self);

    /// Drop the stream and context ahead of returning to the pool.
    fn clear(&mut self);

    /// Install the back-reference to the owning server.
    fn set_server(&mut self, server: WeakServer);

    /// The owning server. `Some` for the whole duration of a handler
    /// invocation; the server outlives its connections by the wait-group
    /// contract.
    fn server(&self) -> Option<Server>;

    /// Address of the connected peer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Local address the connection was accepted on.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// When this connection was dispatched, if it has been started.
    fn start_time(&self) -> Option<Instant>;

    /// Attach a user context to this connection.
    fn set_context(&mut self, ctx: Context);

    /// The connection context; an empty context is materialised on first read.
    fn context(&mut self) -> Context;

    /// Apply `timeout` to every subsequent read. `None` disables the timeout.
    fn set_read_timeout(&mut self, timeout: Option<Duration>);

    /// Apply `timeout` to every subsequent write. `None` disables the timeout.
    fn set_write_timeout(&mut self, timeout: Option<Duration>);

    /// Upgrade the bound stream to server-side TLS, using `config` or,
    /// falling back, the owning server's TLS config. Fails with
    /// [`ServerError::TlsConfigMissing`] when neither is present.
    fn start_tls(
        &mut self,
        config: Option<Arc<rustls::ServerConfig>>,
    ) -> BoxFuture<'_, Result<(), ServerError>>;
}

/// Factory invoked on a connection-pool miss. Only allocates; the core binds
/// the stream afterwards via `reset`.
pub type ConnectionFactory = Arc<dyn Fn() -> Box<dyn Connection> + Send + Sync>;

enum ConnStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ConnStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ConnStream::Plain(s) => s.peer_addr(),
            ConnStream::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            ConnStream::Plain(s) => s.local_addr(),
            ConnStream::Tls(s) => s.get_ref().0.local_addr(),
        }
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ConnStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Default connection variant wrapping a raw TCP stream (optionally upgraded
/// to TLS).
pub struct TcpConnection {
    stream: Option<ConnStream>,
    server: WeakServer,
    ctx: Option<Context>,
    started_at: Option<Instant>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl TcpConnection {
    pub fn new() -> Self {
        Self {
            stream: None,
            server: WeakServer::default(),
            ctx: None,
            started_at: None,
            read_timeout: None,
            write_timeout: None,
            read_deadline: None,
            write_deadline: None,
        }
    }

    fn not_connected() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "no stream bound")
    }
}

impl Default for TcpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for TcpConnection {
    fn reset(&mut self, stream: TcpStream) {
        self.stream = Some(ConnStream::Plain(stream));
        self.ctx = None;
        self.started_at = None;
        self.read_timeout = None;
        self.write_timeout = None;
        self.read_deadline = None;
        self.write_deadline = None;
    }

    fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    fn clear(&mut self) {
        self.stream = None;
        self.ctx = None;
        self.read_deadline = None;
        self.write_deadline = None;
    }

    fn set_server(&mut self, server: WeakServer) {
        self.server = server;
    }

    fn server(&self) -> Option<Server> {
        self.server.upgrade()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream
            .as_ref()
            .ok_or_else(Self::not_connected)?
            .peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream
            .as_ref()
            .ok_or_else(Self::not_connected)?
            .local_addr()
    }

    fn start_time(&self) -> Option<Instant> {
        self.started_at
    }

    fn set_context(&mut self, ctx: Context) {
        self.ctx = Some(ctx);
    }

    fn context(&mut self) -> Context {
        self.ctx.get_or_insert_with(|| Arc::new(())).clone()
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
        self.read_deadline = None;
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
        self.write_deadline = None;
    }

    fn start_tls(
        &mut self,
        config: Option<Arc<rustls::ServerConfig>>,
    ) -> BoxFuture<'_, Result<(), ServerError>> {
        Box::pin(async move {
            let config = match config.or_else(|| self.server().and_then(|s| s.tls_config())) {
                Some(config) => config,
                None => return Err(ServerError::TlsConfigMissing),
            };

            match self.stream.take() {
                Some(ConnStream::Plain(stream)) => {
                    let tls = super::tls::wrap_server(stream, config)
                        .await
                        .map_err(ServerError::AcceptFatal)?;
                    self.stream = Some(ConnStream::Tls(Box::new(tls)));
                    Ok(())
                }
                Some(tls @ ConnStream::Tls(_)) => {
                    self.stream = Some(tls);
                    Err(ServerError::AcceptFatal(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "stream is already TLS",
                    )))
                }
                None => Err(ServerError::AcceptFatal(Self::not_connected())),
            }
        })
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let stream = match this.stream.as_mut() {
            Some(stream) => stream,
            None => return Poll::Ready(Err(Self::not_connected())),
        };

        match Pin::new(stream).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.read_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                if let Some(timeout) = this.read_timeout {
                    let deadline = this
                        .read_deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.read_deadline = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let stream = match this.stream.as_mut() {
            Some(stream) => stream,
            None => return Poll::Ready(Err(Self::not_connected())),
        };

        match Pin::new(stream).poll_write(cx, buf) {
            Poll::Ready(res) => {
                this.write_deadline = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                if let Some(timeout) = this.write_timeout {
                    let deadline = this
                        .write_deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.write_deadline = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(Self::not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Err(Self::not_connected())),
        }
    }
}
