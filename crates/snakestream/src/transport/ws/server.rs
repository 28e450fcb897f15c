//! HTTP/WebSocket server implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::service::StreamService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long live sessions get to tear down once shutdown starts.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4200,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Bind `config.host:config.port` and serve until shutdown.
pub async fn serve(config: ServerConfig, service: Arc<StreamService>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    serve_on(listener, config, service).await
}

/// Serve on an already bound listener until SIGINT, SIGTERM or `POST /shutdown`.
pub async fn serve_on(
    listener: TcpListener,
    config: ServerConfig,
    service: Arc<StreamService>,
) -> anyhow::Result<()> {
    let app = routes(Arc::clone(&service));
    let actual_addr = listener.local_addr()?;

    info!(
        max_streams = service.admission().max_streams(),
        "Starting snakestream server on {}", actual_addr
    );

    let shutdown = service.shutdown_token();
    let signal_service = Arc::clone(&service);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown).await;
            signal_service.trigger_shutdown();
        })
        .await?;

    // Upgraded connections outlive the listener; let their sessions send END and
    // stop their workers.
    service.wait_for_sessions(config.shutdown_grace).await;
    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or /shutdown endpoint).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. That only happens when the tokio
/// runtime is misconfigured, which should fail fast at startup.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested, draining sessions...");
        }
    }
}
