use axum::{body::Body, http::Request, http::header, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{error, info, warn};

/// Logs one line per request: 4xx as warn, 5xx as error, the rest as info
/// with the relayed body size.
pub async fn log_relay_requests(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri().clone();
    let method = req.method().clone();
    let started = Instant::now();

    let response = next.run(req).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    if status.is_client_error() {
        warn!(%method, %uri, %status, elapsed_ms, "Client error");
    } else if status.is_server_error() {
        error!(%method, %uri, %status, elapsed_ms, "Server error");
    } else {
        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info!(%method, %uri, %status, elapsed_ms, size, "Request served");
    }

    response
}
