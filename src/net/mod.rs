//! Network layer.
//!
//! # Data Flow
//! ```text
//! listen():
//!     listener.rs (resolve address, bind with sockopt.rs options)
//! per accepted stream:
//!     connection.rs (pooled object, optional TLS via tls.rs)
//!     → handed to the dispatch layer
//! ```

pub mod connection;
pub mod listener;
pub(crate) mod pool;
pub(crate) mod sockopt;
pub mod tls;

pub use connection::{BoxFuture, Connection, ConnectionFactory, Context, TcpConnection};
pub use tls::server_config_from_pem;
