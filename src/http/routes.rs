use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        .route("/session", get(handlers::get_session))
        // Capture control
        .route("/capture/start", post(handlers::start_capture))
        .route("/capture/stop", post(handlers::stop_capture))
        // Playback control
        .route(
            "/playback/start/:recording_id",
            post(handlers::start_playback),
        )
        .route("/playback/stop", post(handlers::stop_playback))
        // Recordings
        .route("/recordings", get(handlers::list_recordings))
        .route("/recordings/:recording_id", get(handlers::get_recording))
        // Uploads
        .route("/uploads", get(handlers::list_uploads))
        .route("/uploads/:recording_id", post(handlers::enqueue_upload))
        // Event stream
        .route("/events", get(handlers::events))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
