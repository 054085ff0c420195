//! llm-relay - HTTP server entry point.

use llm_relay::{api, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        default_provider = %config.default_provider,
        "loaded configuration"
    );

    // Start HTTP server
    let addr = format!("{}:{}", config.host, config.port);
    info!("starting server on {}", addr);

    api::serve(config).await?;

    Ok(())
}
