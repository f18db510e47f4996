//! Transfer server binary.
//!
//! Parses CLI/env configuration, installs logging, and serves `POST /upload`
//! and `GET /download/{filename}` until Ctrl+C or SIGTERM.

use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::signal;
use tracing::info;

use http_file_transfer::config::{SHUTDOWN_GRACE_SECS, ServerArgs};
use http_file_transfer::logging;
use http_file_transfer::server::{ServerConfig, TransferServer};

/// Starts the transfer server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = ServerArgs::parse();
    logging::init_logging(&args.log_file)?;

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);

    let server = TransferServer::new(ServerConfig::from(&args)).await?;
    server
        .serve_with_shutdown(
            addr,
            Handle::new(),
            shutdown_signal(),
            Duration::from_secs(SHUTDOWN_GRACE_SECS),
        )
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
