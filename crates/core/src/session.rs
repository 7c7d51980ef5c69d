//! Per-session protocol state and the parameters that shape a session.

use sonic_realtime::codec::{EndpointingSensitivity, InferenceConfiguration};
use std::time::Duration;
use uuid::Uuid;

/// Placeholder replaced by the target language in the system prompt.
pub const LANGUAGE_PLACEHOLDER: &str = "{language}";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a translator. Translate each user turn \
into {language}. Treat every turn independently and ignore previous turns. Respond with \
the translation only, without explanations or commentary.";

pub const DEFAULT_VOICE_ID: &str = "matthew";

/// Phases of the session protocol, in the order they must be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    SessionStarted,
    PromptStarted,
    SystemContentSent,
    AudioInputStarted,
    TextTurnInProgress,
    AudioInputEnded,
    PromptEnded,
    SessionEnded,
}

/// How caller audio reaches the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    /// Text turns only; a silence keepalive holds the audio segment open.
    #[default]
    Text,
    /// Live microphone capture.
    Speech,
}

/// Tunables for one translation session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// System prompt template; `{language}` is replaced by the target language.
    pub system_prompt: String,
    pub voice_id: String,
    pub endpointing_sensitivity: Option<EndpointingSensitivity>,
    pub inference: InferenceConfiguration,
    pub input_mode: InputMode,
    pub keepalive_interval: Duration,
    pub keepalive_chunk_bytes: usize,
    pub playback_chunk_bytes: usize,
    pub playback_yield: Duration,
    pub restart_delay: Duration,
    pub max_restarts: u32,
    /// Open a new audio segment after a restart instead of carrying the
    /// previous one over.
    pub reopen_audio_on_restart: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            endpointing_sensitivity: None,
            inference: InferenceConfiguration::default(),
            input_mode: InputMode::Text,
            keepalive_interval: Duration::from_millis(10),
            keepalive_chunk_bytes: 2048,
            playback_chunk_bytes: 1024,
            playback_yield: Duration::from_millis(1),
            restart_delay: Duration::from_secs(1),
            max_restarts: 5,
            reopen_audio_on_restart: false,
        }
    }
}

impl SessionConfig {
    pub fn render_system_prompt(&self, language: &str) -> String {
        self.system_prompt.replace(LANGUAGE_PLACEHOLDER, language)
    }
}

/// Identifiers and phase of one protocol session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub prompt_id: String,
    pub system_content_id: String,
    pub audio_content_id: String,
    pub text_content_id: String,
    pub target_language: String,
    pub phase: Phase,
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

impl Session {
    pub fn new(target_language: impl Into<String>) -> Self {
        Self {
            prompt_id: fresh_id(),
            system_content_id: fresh_id(),
            audio_content_id: fresh_id(),
            text_content_id: fresh_id(),
            target_language: target_language.into(),
            phase: Phase::Idle,
        }
    }

    /// Issues a new text content id for the next text turn.
    pub fn next_text_content(&mut self) -> &str {
        self.text_content_id = fresh_id();
        &self.text_content_id
    }

    /// True while audio and text input events may be sent.
    pub fn accepts_input(&self) -> bool {
        matches!(
            self.phase,
            Phase::AudioInputStarted | Phase::TextTurnInProgress
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_ids_are_distinct() {
        let session = Session::new("Korean");
        assert_eq!(session.phase, Phase::Idle);
        assert_eq!(session.target_language, "Korean");
        assert_ne!(session.prompt_id, session.audio_content_id);
        assert_ne!(session.system_content_id, session.text_content_id);
        assert_ne!(Session::new("Korean").prompt_id, session.prompt_id);
    }

    #[test]
    fn test_next_text_content_rotates_id() {
        let mut session = Session::new("French");
        let before = session.text_content_id.clone();
        let after = session.next_text_content().to_string();
        assert_ne!(before, after);
        assert_eq!(session.text_content_id, after);
    }

    #[test]
    fn test_render_system_prompt() {
        let config = SessionConfig::default();
        let prompt = config.render_system_prompt("Japanese");
        assert!(prompt.contains("into Japanese"));
        assert!(!prompt.contains(LANGUAGE_PLACEHOLDER));
    }

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::Idle < Phase::SessionStarted);
        assert!(Phase::AudioInputStarted < Phase::AudioInputEnded);
        assert!(Phase::PromptEnded < Phase::SessionEnded);
    }
}
