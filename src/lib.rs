pub mod api;
pub mod app_state;
pub mod config;
pub mod ffmpeg;
pub mod job;
pub mod tempo;

use axum::Router;
use axum::extract::Extension;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tracing::info;

//
// Re-export
//
pub use api::{TokenBucket, log_request_errors, serve_video, upload_video, waitlist};
pub use app_state::AppState;
pub use config::Config;
pub use job::{JobLedger, RetimeJob};
pub use tempo::{SpeedFactor, atempo_filter, setpts_filter, speed_tag, tempo_chain};

pub async fn run(config: Config) {
    let listen_on_port = config.listen_on_port;
    let token_rate = config.token_rate;

    let state = AppState::new(&config)
        .await
        .expect("Failed to create app state");

    // Download bandwidth limiter, shared across all connections. A one
    // second burst of capacity, refilled at the configured rate.
    let bucket = TokenBucket::new(token_rate, token_rate);

    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/upload", post(upload_video))
        .route("/videos/{filename}", get(serve_video))
        .route("/waitlist", get(waitlist))
        .layer(axum::middleware::from_fn(log_request_errors))
        .layer(cors)
        .layer(Extension(state))
        .layer(Extension(bucket));

    let addr = format!("0.0.0.0:{listen_on_port}");
    info!("Listening on {addr}");
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.expect("Server error");
}
