//! llm-router-proxy - HTTP server entry point.

use llm_router_proxy::{api, config::AppConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_router_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!(
        router_enabled = config.router_enabled,
        guard_enabled = config.guard.enabled,
        "loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
