use std::net::SocketAddr;

use tracing::info;

mod app;
mod http;
mod seams;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "epgate_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit path > EPGATE_CONFIG env > defaults
    let config_path = std::env::var("EPGATE_CONFIG").ok();
    let config = epgate_core::config::GatewayConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config load failed, using defaults");
        epgate_core::config::GatewayConfig::default()
    });

    let bind_addr = config.bind_addr.clone();
    let state = app::AppState::new(config);
    state.store.register_handler().await;

    let router = app::build_router(state.clone());

    let addr: SocketAddr = bind_addr.parse()?;
    info!(%addr, "EP gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
