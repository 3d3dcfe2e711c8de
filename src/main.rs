mod archive;
mod config;
mod engine;
mod error;
mod handlers;
mod pipeline;
mod progress;
mod transcode;
mod types;
mod upload;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    http::{Method, header},
    routing::{get, post},
};
use config::Config;
use engine::{FfmpegEngine, TranscodeEngine};
use pipeline::ConversionService;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcode::ResolutionJobRunner;
use upload::{ChunkedUploader, HttpTransport};

use types::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hls_car_uploader=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load("config.yml").await?;

    let engine = Arc::new(FfmpegEngine::new(config.engine.clone()));

    // Warm the engine up front; a failed load is retried by the first job.
    let warmup = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = warmup.ensure_loaded().await {
            warn!(error = %e, "Transcoding engine not ready yet");
        }
    });

    let transport =
        HttpTransport::new(&config.storage.base_url).context("Failed to build HTTP client")?;
    info!(endpoint = transport.endpoint(), "Storage uploads configured");
    let uploader = ChunkedUploader::new(
        transport,
        config.storage.max_chunk_size,
        config.storage.token.clone(),
    );
    let runner = ResolutionJobRunner::new(engine, config.engine.bitrate_policy);
    let service = ConversionService::new(runner, uploader, config.storage.gateway_url.clone());

    let host = config.server.host.clone();
    let port = config.server.port;
    let body_limit = config.server.max_upload_bytes;

    let state = AppState {
        config,
        progress: Arc::new(RwLock::new(HashMap::new())),
        service: Arc::new(service),
    };

    let api_routes = Router::new()
        .route("/convert", post(handlers::convert_video))
        .route("/progress/{job_id}", get(handlers::get_progress))
        .route("/jobs/{job_id}", get(handlers::get_job))
        .route("/resolutions", get(handlers::list_resolutions));

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT]),
        )
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid server address")?;
    info!("listening on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    if let Err(e) = state.service.engine().unload().await {
        warn!(error = %e, "Failed to release transcoding engine");
    }
    Ok(())
}
