//! HTTP front end for the proxy.
//!
//! Exposes two operator endpoints (`/health`, `/router/status`) plus a
//! catch-all fallback that runs the guard → classify → resolve → forward →
//! record pipeline against every other inbound request.

pub mod proxy;

use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::context::AppContext;

/// Builds the application context from `config` and starts the HTTP server.
/// Blocks until a shutdown signal (Ctrl+C or SIGTERM) is received, then
/// returns after the listener is dropped.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let ctx = AppContext::build(config)?;

    let app = proxy::routes()
        .layer(TraceLayer::new_for_http())
        .with_state(ctx);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("llm-router-proxy listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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

    tracing::info!("shutdown signal received, draining in-flight requests");
}
