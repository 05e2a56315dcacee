// HTTP server startup logic

use crate::BoxError;
use crate::svc::ServiceContext;
use crate::svc::handlers::UnifiedService;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Bind the configured address and serve until the context's shutdown
/// token fires.
pub async fn start_http_server(context: ServiceContext) -> Result<(), BoxError> {
    let addr: std::net::SocketAddr = context.config.http_addr().parse()?;
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, hostname = %context.config.server.hostname, "HTTP server listening.");

    let shutdown_token = context.shutdown.clone();
    serve_listener(listener, context, shutdown_token).await
}

/// Accept loop over an already bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    context: ServiceContext,
    shutdown_token: CancellationToken,
) -> Result<(), BoxError> {
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                info!("HTTP server shutting down gracefully...");
                break;
            }
            result = listener.accept() => {
                let (stream, remote_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection.");
                        continue;
                    }
                };
                debug!(remote = %remote_addr, "Connection accepted.");

                let io = TokioIo::new(stream);
                let service = UnifiedService::new(context.clone(), remote_addr);

                tokio::spawn(async move {
                    if let Err(err) = Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, TowerToHyperService::new(service))
                        .await
                    {
                        debug!(error = %err, "Failed to serve HTTP connection.");
                    }
                });
            }
        }
    }

    Ok(())
}
