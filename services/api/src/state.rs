//! Shared Application State
//!
//! The service drives at most one translator at a time. It is created lazily
//! by the first request that needs it and replaced when a request asks for a
//! different language or the previous one has stopped.

use chrono::{DateTime, Utc};
use sonic_core::{SessionError, Translator, TranslatorConfig, TranslatorHandle};
use sonic_realtime::StreamConnector;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::SessionInfo;

/// A running translator and the metadata reported about it.
pub struct ActiveTranslation {
    pub id: Uuid,
    pub language: String,
    pub started_at: DateTime<Utc>,
    pub handle: TranslatorHandle,
}

impl ActiveTranslation {
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            language: self.language.clone(),
            status: self.handle.status().to_string(),
            started_at: self.started_at,
        }
    }

    fn reusable_for(&self, language: &str) -> bool {
        self.language == language && self.handle.status().is_running()
    }

    async fn shutdown(mut self) {
        self.handle.stop();
        if let Err(e) = self.handle.join().await {
            warn!(session_id = %self.id, error = %e, "Translator ended with an error.");
        }
        info!(session_id = %self.id, "Translator stopped.");
    }
}

/// The shared application state, created once at startup and passed to all handlers.
pub struct AppState {
    pub config: Arc<TranslatorConfig>,
    connector: Arc<dyn StreamConnector>,
    pub translation: Mutex<Option<ActiveTranslation>>,
}

impl AppState {
    pub fn new(config: TranslatorConfig) -> Self {
        let connector = config.connector();
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: TranslatorConfig, connector: Arc<dyn StreamConnector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            translation: Mutex::new(None),
        }
    }

    /// The requested language, or the configured target language.
    pub fn language_or_default(&self, language: Option<String>) -> String {
        language
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| self.config.target_language.clone())
    }

    /// Makes sure `slot` holds a running translator for `language`, replacing
    /// any translator for another language or one that has stopped.
    pub async fn ensure_translation<'a>(
        &self,
        slot: &'a mut Option<ActiveTranslation>,
        language: &str,
    ) -> Result<&'a mut ActiveTranslation, SessionError> {
        if slot.as_ref().is_some_and(|t| !t.reusable_for(language)) {
            if let Some(previous) = slot.take() {
                previous.shutdown().await;
            }
        }
        if slot.is_none() {
            *slot = Some(self.open(language).await?);
        }
        slot.as_mut().ok_or(SessionError::NotActive)
    }

    /// Stops and removes the current translator. Returns whether one existed.
    pub async fn stop_translation(&self) -> bool {
        let previous = self.translation.lock().await.take();
        match previous {
            Some(translation) => {
                translation.shutdown().await;
                true
            }
            None => false,
        }
    }

    async fn open(&self, language: &str) -> Result<ActiveTranslation, SessionError> {
        let handle = Translator::new(self.connector.clone(), self.config.session_config())
            .translate(language)
            .await?;
        let translation = ActiveTranslation {
            id: Uuid::new_v4(),
            language: language.to_string(),
            started_at: Utc::now(),
            handle,
        };
        info!(session_id = %translation.id, language, "Translator started.");
        Ok(translation)
    }
}
