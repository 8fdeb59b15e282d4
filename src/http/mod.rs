//! HTTP API server for external control (UI shells)
//!
//! This module provides a REST API over the core commands:
//! - POST /capture/start, POST /capture/stop
//! - POST /playback/start/:id, POST /playback/stop
//! - GET /recordings, GET /recordings/:id
//! - POST /uploads/:id, GET /uploads
//! - GET /session - Current session phase
//! - GET /events - Server-sent state and upload events
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
