use super::state::AppState;
use crate::error::CoreError;
use crate::events::CoreEvent;
use crate::session::SessionPhase;
use crate::store::{Recording, RecordingId};
use crate::upload::UploadTask;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CaptureStartedResponse {
    pub recording_id: RecordingId,
    pub state: SessionPhase,
}

#[derive(Debug, Serialize)]
pub struct CaptureStoppedResponse {
    pub recording: Recording,
    pub state: SessionPhase,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub state: SessionPhase,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

fn error_response(err: CoreError) -> Response {
    let status = match &err {
        CoreError::PermissionDenied => StatusCode::FORBIDDEN,
        CoreError::ResourceBusy(_) | CoreError::InvalidStateTransition { .. } => {
            StatusCode::CONFLICT
        }
        CoreError::DeviceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::UploadRetryable(_) | CoreError::UploadPermanent(_) => StatusCode::BAD_GATEWAY,
        CoreError::Storage(_) | CoreError::Serialization(_) => {
            error!("Internal error: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (
        status,
        Json(ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /session
pub async fn get_session(State(state): State<AppState>) -> Json<StateResponse> {
    Json(StateResponse {
        state: state.core.state(),
    })
}

/// POST /capture/start
pub async fn start_capture(State(state): State<AppState>) -> Response {
    match state.core.begin_capture().await {
        Ok(recording_id) => {
            info!("Capture started via HTTP: {}", recording_id);
            (
                StatusCode::OK,
                Json(CaptureStartedResponse {
                    recording_id,
                    state: state.core.state(),
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// POST /capture/stop
pub async fn stop_capture(State(state): State<AppState>) -> Response {
    match state.core.end_capture().await {
        Ok(recording) => (
            StatusCode::OK,
            Json(CaptureStoppedResponse {
                recording,
                state: state.core.state(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /playback/start/:recording_id
pub async fn start_playback(
    State(state): State<AppState>,
    Path(recording_id): Path<String>,
) -> Response {
    let recording_id = RecordingId::new(recording_id);
    match state.core.begin_playback(&recording_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(StateResponse {
                state: state.core.state(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /playback/stop
pub async fn stop_playback(State(state): State<AppState>) -> Response {
    match state.core.end_playback().await {
        Ok(()) => (
            StatusCode::OK,
            Json(StateResponse {
                state: state.core.state(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /recordings
pub async fn list_recordings(State(state): State<AppState>) -> Json<Vec<Recording>> {
    Json(state.core.recordings().await)
}

/// GET /recordings/:recording_id
pub async fn get_recording(
    State(state): State<AppState>,
    Path(recording_id): Path<String>,
) -> Response {
    match state.core.recording(&RecordingId::new(recording_id)).await {
        Ok(recording) => (StatusCode::OK, Json(recording)).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /uploads/:recording_id
pub async fn enqueue_upload(
    State(state): State<AppState>,
    Path(recording_id): Path<String>,
) -> Response {
    match state.core.enqueue_upload(&RecordingId::new(recording_id)).await {
        Ok(task) => (StatusCode::ACCEPTED, Json(task)).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /uploads
pub async fn list_uploads(State(state): State<AppState>) -> Json<Vec<UploadTask>> {
    Json(state.core.upload_tasks().await)
}

/// GET /events
/// Server-sent events for state changes and upload outcomes
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.core.subscribe();

    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = to_sse(&event);
                    return Some((Ok::<_, Infallible>(sse), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event stream lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &CoreEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.kind()).data(data)
}
