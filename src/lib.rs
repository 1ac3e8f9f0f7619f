//! tcpserve — reusable TCP acceptor and per-connection dispatch kernel.
//!
//! Binds a listening socket with tunable kernel options, runs multiple
//! parallel accept loops against the shared listener, hands accepted streams
//! to a sharded worker pool, optionally upgrades them to TLS, invokes a
//! user-supplied request handler, and coordinates graceful shutdown bounded
//! by a deadline.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                       SERVER                          │
//!                 │                                                       │
//!   TCP clients   │  ┌──────────┐   ┌───────────┐   ┌────────────────┐   │
//!   ──────────────┼─▶│   net    │──▶│  accept   │──▶│    dispatch    │   │
//!                 │  │ listener │   │  engine   │   │ (sharded pool) │   │
//!                 │  │ +sockopt │   │ (L loops) │   └───────┬────────┘   │
//!                 │  └──────────┘   └───────────┘           │            │
//!                 │                                         ▼            │
//!                 │  ┌──────────┐   ┌───────────┐   ┌────────────────┐   │
//!                 │  │ conn     │◀──│ TLS wrap  │◀──│ request handler│   │
//!                 │  │ pool     │   │ (optional)│   │  (user code)   │   │
//!                 │  └──────────┘   └───────────┘   └────────────────┘   │
//!                 │                                                       │
//!                 │  ┌─────────────────────────────────────────────────┐ │
//!                 │  │            Cross-Cutting Concerns                │ │
//!                 │  │  ┌────────┐ ┌───────────┐ ┌──────────────────┐  │ │
//!                 │  │  │ config │ │ lifecycle │ │ resilience       │  │ │
//!                 │  │  │        │ │ shutdown  │ │ (accept backoff) │  │ │
//!                 │  │  └────────┘ └───────────┘ └──────────────────┘  │ │
//!                 │  └─────────────────────────────────────────────────┘ │
//!                 └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tcpserve::Connection;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tcpserve::ServerError> {
//!     let server = tcpserve::Server::new("127.0.0.1:5000").await?;
//!     server.set_request_handler(|conn: &mut dyn Connection| {
//!         Box::pin(async move {
//!             let mut buf = [0u8; 4096];
//!             while let Ok(n) = conn.read(&mut buf).await {
//!                 if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         })
//!     });
//!     server.listen().await?;
//!     server.serve().await
//! }
//! ```

// Core subsystems
pub mod config;
pub mod net;
pub mod server;

// Internal machinery
pub(crate) mod dispatch;

// Cross-cutting concerns
pub mod ballast;
pub mod error;
pub mod lifecycle;
pub mod resilience;
pub mod sync;

pub use config::{ListenConfig, ServerConfig};
pub use error::ServerError;
pub use net::{server_config_from_pem, BoxFuture, Connection, Context, TcpConnection};
pub use server::{RequestHandler, Server, WeakServer};
