pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod processor;
pub mod workspace;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::post;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

//
// Re-export
//
pub use api::{VIDEO_FIELD, VIDEO_MP4, log_relay_requests};
pub use app_state::AppState;
pub use config::Config;
pub use error::RelayError;
pub use processor::{OUTPUT_DIR_ENV, OUTPUT_PATH_ENV, Processor};
pub use workspace::ScopedDir;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/video", post(api::analyze_video))
        .layer(DefaultBodyLimit::max(state.upload_limit))
        .layer(axum::middleware::from_fn(api::log_relay_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

/// Bind, serve until Ctrl-C, and surface bind or serve failures to the caller.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let state = AppState::new(&config)?;
    let app = router(state);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(error) => {
            tracing::error!(%error, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    }
}
