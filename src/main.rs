use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod camera_registry;
mod config;
mod errors;
mod mjpeg;
mod recording;
mod recording_lock;
mod segment_store;
mod session_manager;
mod snapshot_cache;
mod source;
mod transcoder;
mod utils;

#[cfg(test)]
mod test_support;

use camera_registry::CameraRegistry;
use config::Config;
use session_manager::SessionManager;
use source::DefaultSourceFetcher;
use transcoder::FfmpegTranscoder;

#[derive(Parser, Debug)]
#[command(name = "camera-relay-server", about = "Snapshot and HLS relay for network cameras")]
struct Args {
    /// Configuration file (TOML, or JSON when it ends in .json)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("camera_relay_server=debug,info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("Could not load {} ({}), using default configuration", args.config, e);
            Config::default()
        }
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let registry = Arc::new(CameraRegistry::from_config(&config.cameras)?);
    if registry.is_empty() {
        warn!("No cameras configured, every camera request will return 404");
    }

    let fetcher = Arc::new(DefaultSourceFetcher::new(Duration::from_secs(10))?);
    let transcoder = Arc::new(FfmpegTranscoder::new(config.ffmpeg.clone()));
    let manager = SessionManager::from_config(&config, registry, fetcher, transcoder);

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => tower_http::cors::CorsLayer::new()
                    .allow_origin(origin_header)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any),
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    let app = api::router(manager.clone()).layer(cors_layer);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Camera relay listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
