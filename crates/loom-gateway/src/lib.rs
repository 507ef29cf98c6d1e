//! Loom gateway: HTTP surface over the loom engine.
//!
//! All endpoints are `POST /functions/v1/<name>` with camelCase JSON bodies. Streaming
//! endpoints answer `text/event-stream`; authorization failures are HTTP 403 before any
//! stream opens.

pub mod error;
pub mod handlers;
pub mod sse;
pub mod state;

pub use error::ApiError;
pub use state::AppState;

use axum::http::header::{HeaderName, AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ]);

    Router::new()
        .route("/health", get(health))
        .route("/functions/v1/audit-extract-concepts", post(handlers::extract::requirements))
        .route("/functions/v1/audit-extract-d2-concepts", post(handlers::extract::implementation))
        .route("/functions/v1/audit-build-tesseract", post(handlers::tesseract::build))
        .route(
            "/functions/v1/collaboration-agent-orchestrator",
            post(handlers::collaboration::orchestrate),
        )
        .route("/functions/v1/orchestrate-agents", post(handlers::agents::orchestrate))
        .with_state(state)
        .layer(cors)
}

async fn health() -> &'static str {
    "OK"
}
