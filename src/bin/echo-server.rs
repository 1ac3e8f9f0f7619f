//! TCP echo server built on the tcpserve kernel.

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcpserve::{Connection, Server, ServerConfig};

#[derive(Parser)]
#[command(name = "echo-server")]
#[command(about = "Echoes every byte back to the client", long_about = None)]
struct Cli {
    /// Server listen address.
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    listen: String,

    /// Number of accept loops (0 = default).
    #[arg(long, default_value_t = 0)]
    loops: usize,

    /// Number of workerpool shards (0 = 2 x loops).
    #[arg(long, default_value_t = 0)]
    wp_shards: usize,

    /// Pin half of the accept loops to OS threads.
    #[arg(long)]
    lock_threads: bool,

    /// Serve TLS using this PEM certificate chain (requires --key).
    #[arg(long, requires = "key")]
    cert: Option<String>,

    /// PEM private key for --cert.
    #[arg(long)]
    key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tcpserve=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = ServerConfig {
        loops: cli.loops,
        worker_shards: cli.wp_shards,
        lock_os_threads: cli.lock_threads,
        ..ServerConfig::default()
    };

    let server = Server::with_config(&cli.listen, config).await?;
    server.set_request_handler(|conn: &mut dyn Connection| {
        Box::pin(async move {
            let mut buf = [0u8; 16 * 1024];
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

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            shutdown.shutdown(Some(std::time::Duration::from_secs(5)));
        }
    });

    match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => {
            server.set_tls_config(tcpserve::server_config_from_pem(cert, key)?);
            server.listen_tls().await?;
        }
        _ => server.listen().await?,
    }

    tracing::info!(
        address = ?server.listen_addr(),
        tls = cli.cert.is_some(),
        "Echo server listening"
    );

    server.serve().await?;
    Ok(())
}
