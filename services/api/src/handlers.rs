//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for translation.
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use sonic_core::SessionError;
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    models::{
        Chunk, ErrorResponse, SessionInfo, SessionOutput, StartSessionPayload, SubmitTextPayload,
        TranslatePayload, TranslateResponse,
    },
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn no_session() -> ApiError {
    ApiError::NotFound("No translation session is running".to_string())
}

fn require_text(text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".to_string()));
    }
    Ok(())
}

/// Translate one piece of text and wait for the result.
///
/// Starts a session when none is running or when `language` differs from the
/// running session's language.
#[utoipa::path(
    post,
    path = "/translate",
    request_body = TranslatePayload,
    responses(
        (status = 200, description = "Translation completed", body = TranslateResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn translate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TranslatePayload>,
) -> Result<Json<TranslateResponse>, ApiError> {
    require_text(&payload.text)?;
    let language = state.language_or_default(payload.language);

    let mut slot = state.translation.lock().await;
    let translation = state.ensure_translation(&mut slot, &language).await?;
    let result = translation.handle.translate_text(&payload.text).await?;
    let audio = translation.handle.drain_audio();
    info!(
        session_id = %translation.id,
        chunks = result.chunks.len(),
        audio_bytes = audio.len(),
        "Translation turn finished."
    );

    Ok(Json(TranslateResponse {
        translation: result.translation,
        chunks: result.chunks.iter().map(Chunk::from).collect(),
        audio_base64: STANDARD.encode(audio),
    }))
}

/// Start a translation session, or return the running one for the same language.
#[utoipa::path(
    post,
    path = "/session",
    request_body = StartSessionPayload,
    responses(
        (status = 201, description = "Session running", body = SessionInfo),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartSessionPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let language = state.language_or_default(payload.language);
    let mut slot = state.translation.lock().await;
    let translation = state.ensure_translation(&mut slot, &language).await?;
    Ok((StatusCode::CREATED, Json(translation.info())))
}

/// Get the running session.
#[utoipa::path(
    get,
    path = "/session",
    responses(
        (status = 200, description = "Session details", body = SessionInfo),
        (status = 404, description = "No session is running", body = ErrorResponse)
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionInfo>, ApiError> {
    let slot = state.translation.lock().await;
    let translation = slot.as_ref().ok_or_else(no_session)?;
    Ok(Json(translation.info()))
}

/// Submit text to the running session without waiting for the translation.
#[utoipa::path(
    post,
    path = "/session/text",
    request_body = SubmitTextPayload,
    responses(
        (status = 202, description = "Text accepted"),
        (status = 400, description = "Bad request or session not active", body = ErrorResponse),
        (status = 404, description = "No session is running", body = ErrorResponse)
    )
)]
pub async fn submit_text(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitTextPayload>,
) -> Result<StatusCode, ApiError> {
    require_text(&payload.text)?;
    let slot = state.translation.lock().await;
    let translation = slot.as_ref().ok_or_else(no_session)?;
    match translation.handle.submit_text(payload.text) {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(SessionError::NotActive) => Err(ApiError::BadRequest(format!(
            "Session {} is not accepting input",
            translation.id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Take all text and audio produced by the running session so far.
#[utoipa::path(
    get,
    path = "/session/output",
    responses(
        (status = 200, description = "Output drained", body = SessionOutput),
        (status = 404, description = "No session is running", body = ErrorResponse)
    )
)]
pub async fn session_output(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionOutput>, ApiError> {
    let mut slot = state.translation.lock().await;
    let translation = slot.as_mut().ok_or_else(no_session)?;
    let chunks = translation.handle.drain_text();
    let audio = translation.handle.drain_audio();
    Ok(Json(SessionOutput {
        chunks: chunks.iter().map(Chunk::from).collect(),
        audio_base64: STANDARD.encode(audio),
    }))
}

/// Stop the running session.
#[utoipa::path(
    delete,
    path = "/session",
    responses(
        (status = 204, description = "Session stopped"),
        (status = 404, description = "No session is running", body = ErrorResponse)
    )
)]
pub async fn stop_session(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    if state.stop_translation().await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(no_session())
    }
}
