use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::info;

use server::config::ServerConfig;
use server::{build_router, build_service, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting TTS server...");

    let config = ServerConfig::from_env();
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, onnx_provider={:?}, mms_enabled={}",
        config.port, config.rate_limit_per_minute, config.onnx_provider, config.mms_enabled
    );

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", config.output_dir.display()))?;

    info!("Loading TTS engines...");
    let tts = Arc::new(build_service(&config));
    let catalog = tts.voices();
    info!(
        "Piper voices: {} (default {:?}), multilingual languages installed: {:?}",
        catalog.piper.voices.len(),
        catalog.piper.default_voice,
        catalog.mms.installed
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let app = build_router(AppState::new(tts, config))?;

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
