//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the translation API and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        Chunk, ErrorResponse, SessionInfo, SessionOutput, StartSessionPayload, SubmitTextPayload,
        TranslatePayload, TranslateResponse,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::translate,
        handlers::start_session,
        handlers::get_session,
        handlers::submit_text,
        handlers::session_output,
        handlers::stop_session,
    ),
    components(
        schemas(Chunk, TranslatePayload, TranslateResponse, StartSessionPayload, SubmitTextPayload, SessionInfo, SessionOutput, ErrorResponse)
    ),
    tags(
        (name = "Sonic API", description = "Real-time text and speech translation sessions")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/translate", post(handlers::translate))
        .route(
            "/session",
            get(handlers::get_session)
                .post(handlers::start_session)
                .delete(handlers::stop_session),
        )
        .route("/session/text", post(handlers::submit_text))
        .route("/session/output", get(handlers::session_output))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
