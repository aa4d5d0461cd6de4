//! Tether Server binary.

use tether_server::config::Config;
use tether_server::{app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_server=debug,tether_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tether Server on {}:{}", config.host, config.port);

    let state = AppState::new(config.clone());
    if let Some(path) = &config.seed_file {
        let count = state.collections.load(path)?;
        tracing::info!(path = %path.display(), records = count, "Loaded seed file");
    }
    if !config.read_only.is_empty() {
        tracing::info!(collections = ?config.read_only, "Read-only collections");
    }

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
