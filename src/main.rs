use anyhow::Result;
use banana_signal::{AppState, RelayConfig, serve, verifier_from_config};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env()?;
    info!(
        bind_addr = %config.bind_addr,
        ping_period = ?config.ping_period(),
        pong_wait = ?config.pong_wait,
        max_message_size = config.max_message_size,
        requeue_survivor = config.requeue_survivor,
        "BananaTalk relay starting"
    );

    let verifier = verifier_from_config(&config.verifier);
    let listener = TcpListener::bind(config.bind_addr).await?;
    let state = AppState::new(config, verifier);

    serve(listener, state, shutdown_signal()).await?;

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
