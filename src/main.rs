use chat_relay_server::{AppError, Settings, WebSocketServer};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> chat_relay_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let settings = Settings::new()?;
    info!("Configuration loaded successfully ({})", settings.environment);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.server.workers.max(1) as usize)
        .enable_all()
        .build()
        .map_err(|e| AppError::InternalError(format!("Failed to start runtime: {}", e)))?;

    runtime.block_on(run(settings))
}

async fn run(settings: Settings) -> chat_relay_server::Result<()> {
    let listener = TcpListener::bind(settings.address()).await?;
    let server = Arc::new(WebSocketServer::new(&settings));

    info!(
        "Server started, accepting connections at ws://{}{}",
        listener.local_addr()?,
        settings.websocket.path
    );

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_server.shutdown();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    server.serve(listener).await;
    info!("Server stopped");
    Ok(())
}
