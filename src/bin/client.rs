use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tunnelmux::{ClientArgs, ClientConfig, ClientError, TunnelClient, initialize_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install ring CryptoProvider");

    let args = ClientArgs::parse();
    initialize_tracing(args.verbose);
    let _log_span = tracing::info_span!("tunnelmux", role = "client", version = env!("CARGO_PKG_VERSION")).entered();

    if args.generate_config {
        ClientConfig::generate_default_file(&args.config)?;
        return Ok(());
    }

    let shutdown_token = CancellationToken::new();
    let shutdown_token_signal = shutdown_token.clone();

    tokio::spawn(async move {
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

    let config = ClientConfig::load(&args)?;
    info!(path = ?args.config, "Config loaded from path.");
    info!(url = %config.registration_url()?, "Registering with server.");
    info!(name = %config.client.name, target = %config.client.target, "Exposing target.");

    let client = TunnelClient::new(config)?;
    let max_attempts = client.config().client.reconnect_attempts;
    let delay = client.config().reconnect_delay();
    let mut attempts = 0u32;

    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                info!("Graceful shutdown started.");
                break;
            }
            result = client.run(shutdown_token.clone()) => {
                match result {
                    Ok(()) if shutdown_token.is_cancelled() => break,
                    Ok(()) => {
                        warn!("Tunnel connection ended.");
                        attempts = 0;
                    }
                    Err(ClientError::Rejected { status, message }) => {
                        error!(status, message = %message, "Server rejected the tunnel.");
                        return Err(ClientError::Rejected { status, message }.into());
                    }
                    Err(e) => {
                        error!(error = %e, "Client run failed.");
                        attempts += 1;
                    }
                }

                if attempts > max_attempts {
                    error!(attempts = max_attempts, "Giving up after repeated connection failures.");
                    return Err("reconnect attempts exhausted".into());
                }

                info!(delay_secs = delay.as_secs(), attempt = attempts, "Client reconnect scheduled.");
                tokio::select! {
                    _ = shutdown_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Ok(())
}
