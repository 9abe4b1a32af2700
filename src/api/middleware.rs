use axum::{body::Body, http::Request, middleware::Next, response::Response};
use tracing::{error, warn};

/// Log 4xx/5xx responses with enough context to trace them back to a
/// request; successful responses stay quiet.
pub async fn log_request_errors(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri().clone();
    let method = req.method().clone();

    let started = std::time::Instant::now();
    let response = next.run(req).await;
    let elapsed_ms = started.elapsed().as_millis();

    let status = response.status();
    if status.is_client_error() {
        warn!(
            method = %method,
            uri = %uri,
            status = %status,
            elapsed_ms,
            "Client error"
        );
    } else if status.is_server_error() {
        error!(
            method = %method,
            uri = %uri,
            status = %status,
            elapsed_ms,
            "Server error"
        );
    }

    response
}
