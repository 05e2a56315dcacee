use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tunnelmux::svc::{ServiceContext, TunnelRegistry, start_http_server};
use tunnelmux::{BoxError, ServerArgs, ServerConfig, initialize_tracing};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = ServerArgs::parse();

    initialize_tracing(args.verbose);

    if args.generate_config {
        ServerConfig::generate_default_file(&args.config)?;
        return Ok(());
    }

    let config = ServerConfig::load(&args)?;
    info!(path = ?args.config, "Configuration loaded.");
    info!(address = %config.http_addr(), "HTTP server configured.");
    info!(hostname = %config.server.hostname, example = %config.public_url("<name>"), "Tunnels served under hostname.");
    info!(version = env!("CARGO_PKG_VERSION"), "Starting tunnelmux server.");

    let shutdown_token = CancellationToken::new();
    let shutdown_token_signal = shutdown_token.clone();

    let signal_handle = tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
                .expect("Failed to install SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => info!(signal = "SIGTERM", "Shutdown signal received."),
                _ = sigint.recv() => info!(signal = "SIGINT", "Shutdown signal received."),
            }
        }
        #[cfg(not(unix))]
        {
            signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
            info!(signal = "SIGINT", "Shutdown signal received.");
        }

        shutdown_token_signal.cancel();
    });

    let context = ServiceContext::new(config, shutdown_token.clone());
    let tunnels = context.tunnels.clone();

    let http_token = shutdown_token.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = start_http_server(context).await {
            error!(error = %e, "HTTP server error.");
            http_token.cancel();
        }
    });

    shutdown_token.cancelled().await;

    info!("Graceful shutdown initiated...");
    graceful_shutdown(&tunnels, Duration::from_secs(5)).await;

    signal_handle.abort();
    http_handle.abort();

    info!("Tunnelmux server shutdown complete.");
    Ok(())
}

/// Tunnels listen on children of the shutdown token, so they are already
/// closing; wait for them to unregister.
async fn graceful_shutdown(tunnels: &TunnelRegistry, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        let active = tunnels.len();
        if active == 0 {
            info!("All tunnels closed.");
            break;
        }

        if start.elapsed() >= timeout {
            info!(active, "Graceful shutdown timeout reached, forcing shutdown.");
            break;
        }

        debug!(active, "Waiting for tunnels to close...");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
