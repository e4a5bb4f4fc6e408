use anyhow::{Context, Result};
use facematch_core::OnnxExtractor;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        bind = %config.bind_addr,
        model_dir = %config.model_dir.display(),
        max_body_bytes = config.max_body_bytes,
        queue_depth = config.queue_depth,
        "facematchd starting"
    );

    // Load models before binding so a bad install fails fast.
    let extractor = OnnxExtractor::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let engine = engine::spawn_engine(extractor, config.queue_depth)
        .context("spawning engine thread")?;

    let app = http::router(http::AppState::new(engine), config.max_body_bytes);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    tracing::info!(addr = %config.bind_addr, "facematchd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("facematchd shutting down");
    Ok(())
}
