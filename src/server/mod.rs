//! Server root object and lifecycle controller.
//!
//! # Data Flow
//! ```text
//! new() → listen() → serve()
//!     serve: start worker pool → spawn accept loops → collect loop results
//!            → stop pool (drain) → wait for in-flight handlers
//!              (indefinitely, or until the shutdown deadline)
//!
//! per accepted stream:
//!     rent pooled connection → reset/start → optional TLS handshake
//!     → request handler → close stream → recycle object
//! ```

mod accept;

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::ballast::Ballast;
use crate::config::{ListenConfig, ServerConfig};
use crate::dispatch::ShardedPool;
use crate::error::ServerError;
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{BoxFuture, Connection, ConnectionFactory, Context};
use crate::net::listener;
use crate::net::pool::ConnectionPool;
use crate::sync::WaitGroup;

/// Request handler invoked once per accepted connection. The handler owns the
/// stream for its duration; on return the core closes it. The connection
/// object must not be retained past return.
pub type RequestHandler =
    Arc<dyn for<'a> Fn(&'a mut dyn Connection) -> BoxFuture<'a, ()> + Send + Sync>;

pub(crate) struct ServerInner {
    listen_addr: SocketAddr,
    listener: RwLock<Option<Arc<TcpListener>>>,
    pub(crate) shutdown: ShutdownSignal,
    handler: RwLock<Option<RequestHandler>>,
    ctx: RwLock<Option<Context>>,
    pub(crate) active: AtomicI32,
    pub(crate) accepted: AtomicU64,
    pub(crate) max_accept: AtomicU64,
    tls_config: RwLock<Option<Arc<rustls::ServerConfig>>>,
    tls_enabled: AtomicBool,
    listen_config: RwLock<ListenConfig>,
    config: RwLock<ServerConfig>,
    pub(crate) wait_group: WaitGroup,
    conn_pool: ConnectionPool,
    ballast: RwLock<Option<Ballast>>,
}

/// TCP server kernel: binds a tuned listener, runs parallel accept loops,
/// dispatches each accepted stream to a sharded worker pool and invokes the
/// user request handler, with graceful shutdown bounded by an optional
/// deadline.
///
/// `Server` is a cheap-clone handle; clones share all state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Non-owning back-reference from a pooled connection to its server. The
/// server outlives its connections by the wait-group contract, so `upgrade`
/// succeeds for the whole duration of a handler invocation.
#[derive(Clone)]
pub struct WeakServer(Weak<ServerInner>);

impl Default for WeakServer {
    fn default() -> Self {
        Self(Weak::new())
    }
}

impl WeakServer {
    pub fn upgrade(&self) -> Option<Server> {
        self.0.upgrade().map(|inner| Server { inner })
    }
}

impl Server {
    /// Create a server for `addr` (`host:port`) with default configuration.
    /// Fails if the address does not resolve.
    pub async fn new(addr: &str) -> Result<Self, ServerError> {
        Self::with_config(addr, ServerConfig::default()).await
    }

    /// Create a server with explicit tuning knobs. Allocates the heap ballast
    /// here when one is configured.
    pub async fn with_config(addr: &str, config: ServerConfig) -> Result<Self, ServerError> {
        let listen_addr = listener::resolve_addr(addr).await?;
        let ballast = if config.ballast_size_mb > 0 {
            Some(Ballast::new(config.ballast_size_mb))
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(ServerInner {
                listen_addr,
                listener: RwLock::new(None),
                shutdown: ShutdownSignal::new(),
                handler: RwLock::new(None),
                ctx: RwLock::new(None),
                active: AtomicI32::new(0),
                accepted: AtomicU64::new(0),
                max_accept: AtomicU64::new(0),
                tls_config: RwLock::new(None),
                tls_enabled: AtomicBool::new(false),
                listen_config: RwLock::new(config.listen.clone()),
                config: RwLock::new(config),
                wait_group: WaitGroup::new(),
                conn_pool: ConnectionPool::new(),
                ballast: RwLock::new(ballast),
            }),
        })
    }

    /// Downgrade to a non-owning handle, as stored on pooled connections.
    pub fn downgrade(&self) -> WeakServer {
        WeakServer(Arc::downgrade(&self.inner))
    }

    /// Set the request handler invoked for every dispatched connection.
    pub fn set_request_handler<F>(&self, handler: F)
    where
        F: for<'a> Fn(&'a mut dyn Connection) -> BoxFuture<'a, ()> + Send + Sync + 'static,
    {
        *self.inner.handler.write().expect("handler lock poisoned") = Some(Arc::new(handler));
    }

    /// Set the factory used when the connection pool misses. The factory only
    /// allocates; the core binds the stream afterwards.
    pub fn set_connection_factory<F>(&self, factory: F)
    where
        F: Fn() -> Box<dyn Connection> + Send + Sync + 'static,
    {
        self.inner.conn_pool.set_factory(Arc::new(factory) as ConnectionFactory);
    }

    /// Store a TLS config without enabling TLS-on-accept; it also serves as
    /// the default for inline `start_tls`.
    pub fn set_tls_config(&self, config: Arc<rustls::ServerConfig>) {
        *self.inner.tls_config.write().expect("tls lock poisoned") = Some(config);
    }

    /// The TLS config previously stored, if any.
    pub fn tls_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.inner.tls_config.read().expect("tls lock poisoned").clone()
    }

    /// Wrap every accepted stream in server-side TLS. Requires a TLS config.
    pub fn enable_tls(&self) -> Result<(), ServerError> {
        if self.tls_config().is_none() {
            return Err(ServerError::TlsConfigMissing);
        }
        self.inner.tls_enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Replace the socket options used at bind time.
    pub fn set_listen_config(&self, config: ListenConfig) {
        *self
            .inner
            .listen_config
            .write()
            .expect("listen config lock poisoned") = config;
    }

    pub fn listen_config(&self) -> ListenConfig {
        self.inner
            .listen_config
            .read()
            .expect("listen config lock poisoned")
            .clone()
    }

    /// Replace the tuning configuration; resizes the ballast to match.
    pub fn set_config(&self, config: ServerConfig) {
        let ballast = if config.ballast_size_mb > 0 {
            Some(Ballast::new(config.ballast_size_mb))
        } else {
            None
        };
        *self.inner.ballast.write().expect("ballast lock poisoned") = ballast;
        *self.inner.listen_config.write().expect("listen config lock poisoned") =
            config.listen.clone();
        *self.inner.config.write().expect("config lock poisoned") = config;
    }

    pub fn config(&self) -> ServerConfig {
        let mut config = self.inner.config.read().expect("config lock poisoned").clone();
        config.listen = self.listen_config();
        config
    }

    /// Cap the number of accepted connections; once reached the server shuts
    /// down after in-flight handlers complete. 0 means unlimited.
    pub fn set_max_accept_connections(&self, limit: u64) {
        self.inner.max_accept.store(limit, Ordering::Release);
    }

    /// Attach a server-wide user context, handed to connections on request.
    pub fn set_context(&self, ctx: Context) {
        *self.inner.ctx.write().expect("context lock poisoned") = Some(ctx);
    }

    /// The server context; an empty context is materialised on first read.
    pub fn context(&self) -> Context {
        let mut guard = self.inner.ctx.write().expect("context lock poisoned");
        guard.get_or_insert_with(|| Arc::new(())).clone()
    }

    /// Number of connections currently inside a handler (or queued with their
    /// accounting already done).
    pub fn active_connections(&self) -> i32 {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Total number of streams accepted so far, dispatched or suppressed.
    pub fn accepted_connections(&self) -> u64 {
        self.inner.accepted.load(Ordering::Acquire)
    }

    /// The bound address, once `listen` has run. Useful with port 0.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .read()
            .expect("listener lock poisoned")
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    /// Bind the listener with the configured socket options.
    pub async fn listen(&self) -> Result<(), ServerError> {
        let listener = listener::bind_listener(self.inner.listen_addr, &self.listen_config())?;
        *self.inner.listener.write().expect("listener lock poisoned") =
            Some(Arc::new(listener));
        Ok(())
    }

    /// Enable TLS-on-accept, then bind.
    pub async fn listen_tls(&self) -> Result<(), ServerError> {
        self.enable_tls()?;
        self.listen().await
    }

    /// Request a graceful shutdown.
    ///
    /// - `None`: stop accepting, wait indefinitely for in-flight handlers.
    /// - `Some(d)`: stop accepting, wait at most `d` for handlers.
    /// - `Some(Duration::ZERO)`: stop accepting and do not wait at all.
    pub fn shutdown(&self, grace: Option<Duration>) {
        let deadline = grace.map(|d| Instant::now() + d);
        self.inner.shutdown.trigger(deadline);
    }

    /// Shut down immediately without waiting for any connection.
    pub fn halt(&self) {
        self.shutdown(Some(Duration::ZERO));
    }

    /// Accept and dispatch connections until shutdown (or a fatal accept
    /// error). Fails fast when `listen` has not produced a listener.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let listener = self
            .inner
            .listener
            .read()
            .expect("listener lock poisoned")
            .clone()
            .ok_or(ServerError::NoListener)?;

        let config = self.config();
        let loops = config.effective_loops();
        let shards = config.effective_worker_shards();

        tracing::info!(
            loops,
            worker_shards = shards,
            lock_os_threads = config.lock_os_threads,
            "Serving connections"
        );

        let pool = ShardedPool::new(shards, config.worker_idle);
        // Sized to the loop count so loop results never block on send.
        let (results_tx, mut results_rx) = mpsc::channel(loops);
        accept::spawn_accept_loops(
            &self.inner,
            &listener,
            &pool,
            loops,
            config.lock_os_threads,
            results_tx,
        );
        drop(listener);

        let mut first_err = None;
        for _ in 0..loops {
            match results_rx.recv().await {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    first_err.get_or_insert(err);
                }
                None => break,
            }
        }

        // All loops have exited; close the listening socket.
        *self.inner.listener.write().expect("listener lock poisoned") = None;

        pool.stop().await;

        if let Some(err) = first_err {
            return Err(err);
        }

        if self.inner.active.load(Ordering::Acquire) == 0 {
            return Ok(());
        }

        match self.inner.shutdown.deadline() {
            None => self.inner.wait_group.wait().await,
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    // Bounded drain: return at the deadline even with
                    // handlers still running, or as soon as they finish.
                    let _ = tokio::time::timeout(deadline - now, self.inner.wait_group.wait())
                        .await;
                }
            }
        }

        tracing::info!(
            accepted = self.accepted_connections(),
            still_active = self.active_connections(),
            "Serve finished"
        );

        Ok(())
    }
}

/// Restores the active counter and the wait-group on every exit path of
/// `serve_conn`, including handler panics.
struct ConnGuard(Arc<ServerInner>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
        self.0.wait_group.done();
    }
}

/// Serve a single accepted stream: bind it to a pooled connection object,
/// optionally wrap it in TLS, run the handler, then close and recycle.
pub(crate) async fn serve_conn(inner: Arc<ServerInner>, stream: TcpStream) {
    let guard = ConnGuard(inner);
    let inner = &guard.0;

    let mut conn = inner.conn_pool.rent();
    conn.reset(stream);
    conn.set_server(WeakServer(Arc::downgrade(inner)));
    conn.start();

    if inner.tls_enabled.load(Ordering::Acquire) {
        let config = inner.tls_config.read().expect("tls lock poisoned").clone();
        if let Err(err) = conn.start_tls(config).await {
            tracing::debug!(error = %err, "TLS handshake failed; closing connection");
            inner.conn_pool.put(conn);
            return;
        }
    }

    let handler = inner.handler.read().expect("handler lock poisoned").clone();
    match handler {
        Some(handler) => {
            let invocation = AssertUnwindSafe(handler(&mut *conn)).catch_unwind();
            if invocation.await.is_err() {
                tracing::error!("Request handler panicked");
            }
        }
        None => tracing::warn!("No request handler set; closing connection"),
    }

    let _ = conn.shutdown().await;
    inner.conn_pool.put(conn);
}
