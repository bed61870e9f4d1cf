use super::state::AppState;
use crate::error::{ErrorInfo, ErrorKind, SessionError};
use crate::session::SessionSnapshot;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::{error, info};

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

fn status_code(err: &SessionError) -> StatusCode {
    match err.kind() {
        ErrorKind::NotActive | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::MediaAcquisition => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(err: SessionError) -> Response {
    (
        status_code(&err),
        Json(ErrorResponse {
            error: ErrorInfo::from(&err),
        }),
    )
        .into_response()
}

fn ok(status: &str) -> Response {
    (
        StatusCode::OK,
        Json(StatusResponse {
            status: status.to_string(),
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
pub async fn get_session(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.session.snapshot())
}

/// POST /session/start
pub async fn start_session(State(state): State<AppState>) -> Response {
    match state.session.start().await {
        Ok(session_id) => {
            info!("Session {} started over HTTP", session_id);
            (
                StatusCode::OK,
                Json(StartSessionResponse {
                    session_id,
                    status: "connected".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to start session: {}", e);
            error_response(e)
        }
    }
}

/// POST /session/stop
pub async fn stop_session(State(state): State<AppState>) -> Response {
    state.session.stop().await;
    ok("stopped")
}

/// POST /session/emergency-stop
pub async fn emergency_stop(State(state): State<AppState>) -> Response {
    state.session.emergency_stop().await;
    ok("stopped")
}

/// POST /session/listen/start
pub async fn start_listening(State(state): State<AppState>) -> Response {
    match state.session.start_listening().await {
        Ok(()) => ok("listening"),
        Err(e) => error_response(e),
    }
}

/// POST /session/listen/stop
pub async fn stop_listening(State(state): State<AppState>) -> Response {
    match state.session.stop_listening().await {
        Ok(()) => ok("idle"),
        Err(e) => error_response(e),
    }
}

/// POST /session/trigger
pub async fn trigger_llm(State(state): State<AppState>) -> Response {
    match state.session.trigger_llm().await {
        Ok(()) => ok("triggered"),
        Err(e) => error_response(e),
    }
}

/// POST /session/reset
pub async fn reset_pipeline(State(state): State<AppState>) -> Response {
    state.session.reset_pipeline().await;
    ok("reset")
}

/// POST /session/error/clear
pub async fn clear_error(State(state): State<AppState>) -> Response {
    state.session.clear_error().await;
    ok("cleared")
}
