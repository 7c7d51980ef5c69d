//! API Models
//!
//! Request and response bodies for the translation endpoints, annotated for
//! OpenAPI generation with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sonic_core::TextChunk;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct Chunk {
    #[schema(example = "assistant")]
    pub role: String,
    #[schema(example = "Hola, ¿cómo estás?")]
    pub content: String,
}

impl From<&TextChunk> for Chunk {
    fn from(chunk: &TextChunk) -> Self {
        Self {
            role: chunk.role.to_string(),
            content: chunk.content.clone(),
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct TranslatePayload {
    #[schema(example = "Hello, how are you?")]
    pub text: String,
    /// Defaults to the configured target language.
    #[schema(example = "Spanish")]
    pub language: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct TranslateResponse {
    pub translation: String,
    pub chunks: Vec<Chunk>,
    /// 24 kHz 16-bit mono PCM, base64 encoded.
    pub audio_base64: String,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct StartSessionPayload {
    #[schema(example = "Japanese")]
    pub language: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct SubmitTextPayload {
    #[schema(example = "Where is the train station?")]
    pub text: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionInfo {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub language: String,
    #[schema(example = "active")]
    pub status: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct SessionOutput {
    pub chunks: Vec<Chunk>,
    /// 24 kHz 16-bit mono PCM, base64 encoded.
    pub audio_base64: String,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
