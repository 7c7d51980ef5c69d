//! Wire codec for the Sonic bidirectional streaming protocol.
//!
//! Every message in either direction is a JSON object of the form
//! `{"event": {<kind>: {...}}}`. Outbound events are built from typed structs
//! and serialized with `serde_json`, so user text is always escaped correctly.
//! Inbound frames are decoded into the small [`Frame`] union the session
//! manager acts upon; every other event kind collapses into [`Frame::Other`].

use base64::Engine;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Sample rate of audio sent to the service (PCM16 mono).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of audio produced by the service (PCM16 mono).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
pub const SAMPLE_SIZE_BITS: u16 = 16;
pub const CHANNEL_COUNT: u16 = 1;

const LPCM_MEDIA_TYPE: &str = "audio/lpcm";
const TEXT_MEDIA_TYPE: &str = "text/plain";
const SPECULATIVE_STAGE: &str = "SPECULATIVE";

/// Errors raised while decoding a single inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no event envelope")]
    MissingEnvelope,
    #[error("malformed `{kind}` event: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("audio payload is not valid base64: {0}")]
    Audio(#[from] base64::DecodeError),
}

// --- Shared protocol enums ---

/// Speaker role attached to a content segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Text,
    Audio,
}

/// How eagerly the service decides that a speaker has finished a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EndpointingSensitivity {
    High,
    Medium,
    Low,
}

impl FromStr for EndpointingSensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            other => Err(format!("'{}' is not one of HIGH, MEDIUM, LOW", other)),
        }
    }
}

// --- Outbound events ---

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfiguration {
    pub max_tokens: u32,
    pub top_p: f64,
    pub temperature: f64,
}

impl Default for InferenceConfiguration {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_p: 0.9,
            temperature: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnDetectionConfiguration {
    pub endpointing_sensitivity: EndpointingSensitivity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub inference_configuration: InferenceConfiguration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection_configuration: Option<TurnDetectionConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConfiguration {
    pub media_type: String,
}

impl MediaConfiguration {
    pub fn text() -> Self {
        Self {
            media_type: TEXT_MEDIA_TYPE.to_string(),
        }
    }
}

/// LPCM format description shared by the audio input and output configurations.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfiguration {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    pub encoding: String,
    pub audio_type: String,
}

impl AudioConfiguration {
    /// 16 kHz / 16-bit / mono speech input.
    pub fn input() -> Self {
        Self {
            media_type: LPCM_MEDIA_TYPE.to_string(),
            sample_rate_hertz: INPUT_SAMPLE_RATE,
            sample_size_bits: SAMPLE_SIZE_BITS,
            channel_count: CHANNEL_COUNT,
            voice_id: None,
            encoding: "base64".to_string(),
            audio_type: "SPEECH".to_string(),
        }
    }

    /// 24 kHz / 16-bit / mono speech output spoken with `voice_id`.
    pub fn output(voice_id: &str) -> Self {
        Self {
            sample_rate_hertz: OUTPUT_SAMPLE_RATE,
            voice_id: Some(voice_id.to_string()),
            ..Self::input()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptStart {
    pub prompt_name: String,
    pub text_output_configuration: MediaConfiguration,
    pub audio_output_configuration: AudioConfiguration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStart {
    pub prompt_name: String,
    pub content_name: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub interactive: bool,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_input_configuration: Option<MediaConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_input_configuration: Option<AudioConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextInput {
    pub prompt_name: String,
    pub content_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInput {
    pub prompt_name: String,
    pub content_name: String,
    /// Base64-encoded PCM16 samples.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentEnd {
    pub prompt_name: String,
    pub content_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptEnd {
    pub prompt_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEnd {}

/// Every event the client sends to the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboundEvent {
    SessionStart(SessionStart),
    PromptStart(PromptStart),
    ContentStart(ContentStart),
    TextInput(TextInput),
    AudioInput(AudioInput),
    ContentEnd(ContentEnd),
    PromptEnd(PromptEnd),
    SessionEnd(SessionEnd),
}

impl OutboundEvent {
    /// Builds a SYSTEM or USER text content start.
    pub fn text_content_start(prompt_name: &str, content_name: &str, role: Role) -> Self {
        Self::ContentStart(ContentStart {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.to_string(),
            content_type: ContentType::Text,
            interactive: role != Role::System,
            role,
            text_input_configuration: Some(MediaConfiguration::text()),
            audio_input_configuration: None,
        })
    }

    /// Builds the USER audio content start for 16 kHz speech input.
    pub fn audio_content_start(prompt_name: &str, content_name: &str) -> Self {
        Self::ContentStart(ContentStart {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.to_string(),
            content_type: ContentType::Audio,
            interactive: true,
            role: Role::User,
            text_input_configuration: None,
            audio_input_configuration: Some(AudioConfiguration::input()),
        })
    }

    pub fn text_input(prompt_name: &str, content_name: &str, content: &str) -> Self {
        Self::TextInput(TextInput {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.to_string(),
            content: content.to_string(),
        })
    }

    /// Builds an audio input event, base64-encoding the raw PCM bytes.
    pub fn audio_input(prompt_name: &str, content_name: &str, pcm: &[u8]) -> Self {
        Self::AudioInput(AudioInput {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.to_string(),
            content: base64::engine::general_purpose::STANDARD.encode(pcm),
        })
    }

    pub fn content_end(prompt_name: &str, content_name: &str) -> Self {
        Self::ContentEnd(ContentEnd {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.to_string(),
        })
    }

    /// The protocol name of this event, e.g. `"contentStart"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStart(_) => "sessionStart",
            Self::PromptStart(_) => "promptStart",
            Self::ContentStart(_) => "contentStart",
            Self::TextInput(_) => "textInput",
            Self::AudioInput(_) => "audioInput",
            Self::ContentEnd(_) => "contentEnd",
            Self::PromptEnd(_) => "promptEnd",
            Self::SessionEnd(_) => "sessionEnd",
        }
    }
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    event: &'a OutboundEvent,
}

/// Serializes an event into its UTF-8 wire envelope.
pub fn encode(event: &OutboundEvent) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&OutboundEnvelope { event })
}

/// Converts caller-provided bytes to text, replacing invalid UTF-8 sequences
/// with U+FFFD instead of failing.
pub fn lossy_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

// --- Inbound frames ---

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Start of a content segment. `speculative` is `None` when the event
    /// carried no generation-stage marker.
    ContentStart {
        role: Role,
        speculative: Option<bool>,
    },
    TextOutput {
        role: Option<Role>,
        content: String,
    },
    /// Decoded 24 kHz PCM16 bytes.
    AudioOutput { bytes: Vec<u8> },
    Other { kind: String },
}

#[derive(Deserialize)]
struct InboundEnvelope {
    event: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundContentStart {
    role: Role,
    #[serde(default)]
    additional_model_fields: Option<Value>,
}

impl InboundContentStart {
    /// `additionalModelFields` arrives as a JSON-encoded string; some service
    /// versions inline the object instead.
    fn generation_stage(&self) -> Option<String> {
        let fields = match self.additional_model_fields.as_ref()? {
            Value::String(raw) => serde_json::from_str::<Value>(raw).ok()?,
            other => other.clone(),
        };
        fields
            .get("generationStage")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Deserialize)]
struct InboundTextOutput {
    content: String,
    #[serde(default)]
    role: Option<Role>,
}

#[derive(Deserialize)]
struct InboundAudioOutput {
    content: String,
}

fn parse_body<T: DeserializeOwned>(kind: &str, body: Value) -> Result<T, DecodeError> {
    serde_json::from_value(body).map_err(|e| DecodeError::Malformed {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Decodes one inbound frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let envelope: InboundEnvelope = serde_json::from_slice(bytes)?;
    let (kind, body) = envelope
        .event
        .and_then(|event| event.into_iter().next())
        .ok_or(DecodeError::MissingEnvelope)?;

    match kind.as_str() {
        "contentStart" => {
            let start: InboundContentStart = parse_body(&kind, body)?;
            let speculative = start
                .generation_stage()
                .map(|stage| stage == SPECULATIVE_STAGE);
            Ok(Frame::ContentStart {
                role: start.role,
                speculative,
            })
        }
        "textOutput" => {
            let text: InboundTextOutput = parse_body(&kind, body)?;
            Ok(Frame::TextOutput {
                role: text.role,
                content: text.content,
            })
        }
        "audioOutput" => {
            let audio: InboundAudioOutput = parse_body(&kind, body)?;
            let bytes = base64::engine::general_purpose::STANDARD.decode(audio.content)?;
            Ok(Frame::AudioOutput { bytes })
        }
        _ => Ok(Frame::Other { kind }),
    }
}
