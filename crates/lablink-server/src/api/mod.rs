//! HTTP API: lease management for the backend and session info for the
//! attached client.

mod auth;

use crate::hardware::HardwareChannel;
use crate::session::{LifecycleController, SessionCreated, SessionDeleted};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lablink_core::{CreateSessionRequest, DeviceType, MySessionView, SessionView, UartSpeed};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<LifecycleController>,
    pub channel: Arc<dyn HardwareChannel>,
    pub api_secret: Arc<str>,
    pub device_type: DeviceType,
}

/// A request refused before reaching the lifecycle controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
    Unauthorized,
    BadRequest(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/api/session",
            post(create_session).get(get_session).delete(delete_session),
        )
        .route("/api/my-session", get(my_session))
        .route("/api/uart/speed", post(set_uart_speed))
        .with_state(state)
}

/// Serve the API until `shutdown_rx` fires.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> lablink_core::LabResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "failed to bind HTTP API");
        lablink_core::LabError::Transport(format!("HTTP bind failed: {e}"))
    })?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("HTTP API shutting down");
        })
        .await?;
    Ok(())
}

async fn create_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::require_backend(&headers, &state.api_secret)?;
    let request: CreateSessionRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("Invalid request body"))?;
    let expires_at = request
        .end_time()
        .map_err(|_| ApiError::BadRequest("Invalid date format"))?;

    let outcome = state
        .controller
        .create_session(request.token, expires_at)
        .await;
    let response = match outcome {
        SessionCreated::Created => (
            StatusCode::CREATED,
            Json(json!({ "message": "Successfully created" })),
        ),
        SessionCreated::Overwritten => (
            StatusCode::CONFLICT,
            Json(json!({ "message": "Session overwritten" })),
        ),
    };
    Ok(response.into_response())
}

async fn get_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<SessionView>, ApiError> {
    auth::require_backend(&headers, &state.api_secret)?;
    let current = state.controller.current_session();
    Ok(Json(SessionView {
        session_end_time: current.as_ref().map(|info| info.expires_at),
        token: current.map(|info| info.token),
    }))
}

async fn delete_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::require_backend(&headers, &state.api_secret)?;
    let response = match state.controller.delete_session().await {
        SessionDeleted::Reset => (
            StatusCode::CONFLICT,
            Json(json!({ "message": "Session was reset" })),
        ),
        SessionDeleted::AlreadyInactive => (
            StatusCode::OK,
            Json(json!({ "message": "Session has already been not active" })),
        ),
    };
    Ok(response.into_response())
}

async fn my_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<MySessionView>, ApiError> {
    let info = auth::require_client(&headers, state.controller.lease())?;
    Ok(Json(MySessionView {
        session_end_time: info.expires_at,
        device_type: state.device_type,
    }))
}

async fn set_uart_speed(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UartSpeed>, ApiError> {
    auth::require_client(&headers, state.controller.lease())?;
    let request: UartSpeed = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("Invalid request body"))?;
    if let Err(e) = state.channel.set_baud_rate(request.speed).await {
        warn!(speed = request.speed, error = %e, "failed to change UART speed");
        return Err(ApiError::BadRequest("Failed to change speed"));
    }
    info!(speed = request.speed, "UART speed changed");
    Ok(Json(request))
}
