use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use roamjs_api_service::build_router;
use roamjs_api_service::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_filter))
        .init();

    let bind_addr = config.bind_addr;
    let router = build_router(config);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(
        target: "roamjs.boot",
        addr = %bind_addr,
        version = env!("CARGO_PKG_VERSION"),
        "roamjs api service listening",
    );

    axum::serve(listener, router)
        .await
        .context("server exited with an error")?;

    Ok(())
}
