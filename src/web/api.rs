//! Defines the Axum API routes and handlers.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde_json::json;

use crate::camera::{CameraError, SessionDescription, UnavailableReason};
use crate::command::{CommandError, PrinterCommand};
use crate::coordinator::CoordinatorHandle;
use crate::fleet::Fleet;
use crate::web::auth::require_token;
use crate::web::models::{CameraModeRequest, PowerRequest, PrinterListResponse, PrinterSummary};

/// Helper to create a JSON error response with a message and status code
pub fn json_error(message: &str, status: StatusCode) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn ok() -> Response {
    (StatusCode::OK, Json(json!({ "result": "ok" }))).into_response()
}

pub struct AppStateInner {
    pub fleet: Fleet,
    pub api_token: Option<String>,
}
pub type AppState = Arc<AppStateInner>;

type ApiResult = Result<Response, Response>;

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/printers", get(list_printers))
        .route("/api/v1/printers/{id}/state", get(get_state))
        .route("/api/v1/printers/{id}/diagnostics", get(get_diagnostics))
        .route("/api/v1/printers/{id}/camera", get(get_camera))
        .route("/api/v1/printers/{id}/camera/stream", get(camera_stream))
        .route("/api/v1/printers/{id}/camera/snapshot", get(camera_snapshot))
        .route("/api/v1/printers/{id}/camera/webrtc", post(camera_webrtc))
        .route("/api/v1/printers/{id}/camera/mode", put(set_camera_mode))
        .route("/api/v1/printers/{id}/command", post(send_command))
        .route("/api/v1/printers/{id}/power", put(set_power))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

fn printer<'a>(state: &'a AppState, id: &str) -> Result<&'a CoordinatorHandle, Response> {
    state
        .fleet
        .get(id)
        .ok_or_else(|| json_error(&format!("Unknown printer '{id}'"), StatusCode::NOT_FOUND))
}

fn command_error(e: &CommandError) -> Response {
    let status = match e {
        CommandError::Unsupported(_) | CommandError::Redundant(_) | CommandError::InvalidState(_) => {
            StatusCode::CONFLICT
        }
        CommandError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        CommandError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CommandError::NotConnected | CommandError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        CommandError::Send(_) => StatusCode::BAD_GATEWAY,
    };
    json_error(&e.to_string(), status)
}

fn camera_error(e: &CameraError) -> Response {
    let status = match e {
        CameraError::Unavailable(UnavailableReason::NoCamera) => StatusCode::NOT_FOUND,
        CameraError::Unavailable(UnavailableReason::HelperUnavailable) => StatusCode::SERVICE_UNAVAILABLE,
        CameraError::Signaling(_) => StatusCode::BAD_REQUEST,
        CameraError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        CameraError::Http(_) | CameraError::UpstreamStatus(_) | CameraError::NoFrame => StatusCode::BAD_GATEWAY,
    };
    json_error(&e.to_string(), status)
}

/// GET /api/v1/printers
async fn list_printers(State(state): State<AppState>) -> Response {
    let printers = state
        .fleet
        .iter()
        .map(|handle| PrinterSummary::new(&handle.config().host, &handle.snapshot()))
        .collect();
    (StatusCode::OK, Json(PrinterListResponse { printers })).into_response()
}

/// GET /api/v1/printers/{id}/state
async fn get_state(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let printer = printer(&state, &id)?;
    Ok((StatusCode::OK, Json(printer.snapshot())).into_response())
}

/// GET /api/v1/printers/{id}/diagnostics
async fn get_diagnostics(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let printer = printer(&state, &id)?;
    Ok((StatusCode::OK, Json(printer.diagnostics().await)).into_response())
}

/// GET /api/v1/printers/{id}/camera
async fn get_camera(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let printer = printer(&state, &id)?;
    Ok((StatusCode::OK, Json(printer.camera())).into_response())
}

/// GET /api/v1/printers/{id}/camera/stream -- bytes are passed through as-is
async fn camera_stream(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let printer = printer(&state, &id)?;
    let relay = printer.mjpeg_relay().map_err(|e| camera_error(&e))?;
    let (content_type, stream) = relay.open().await.map_err(|e| camera_error(&e))?;
    tracing::debug!(printer = %id, url = %relay.url(), "relaying MJPEG stream");
    Ok(([(header::CONTENT_TYPE, content_type)], Body::from_stream(stream)).into_response())
}

/// GET /api/v1/printers/{id}/camera/snapshot
async fn camera_snapshot(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let printer = printer(&state, &id)?;
    let frame = printer.camera_snapshot().await.map_err(|e| camera_error(&e))?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], frame).into_response())
}

/// POST /api/v1/printers/{id}/camera/webrtc
async fn camera_webrtc(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(offer): Json<SessionDescription>,
) -> ApiResult {
    let printer = printer(&state, &id)?;
    let answer = printer.relay_webrtc_offer(&offer).await.map_err(|e| camera_error(&e))?;
    Ok((StatusCode::OK, Json(answer)).into_response())
}

/// PUT /api/v1/printers/{id}/camera/mode
async fn set_camera_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CameraModeRequest>,
) -> ApiResult {
    let printer = printer(&state, &id)?;
    printer.set_camera_mode(payload.mode).await;
    Ok(ok())
}

/// POST /api/v1/printers/{id}/command
async fn send_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(command): Json<PrinterCommand>,
) -> ApiResult {
    let printer = printer(&state, &id)?;
    printer.send_command(command).await.map_err(|e| command_error(&e))?;
    Ok(ok())
}

/// PUT /api/v1/printers/{id}/power
async fn set_power(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<PowerRequest>,
) -> ApiResult {
    let printer = printer(&state, &id)?;
    printer.set_power(payload.power).await;
    Ok(ok())
}
