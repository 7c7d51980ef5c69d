//! Drives the session protocol state machine over one duplex stream.
//!
//! The controller owns the sending half of the stream behind a
//! `tokio::sync::Mutex`, which serializes sends from the supervisor, the
//! keepalive task and the capture task. The receiving half is handed back
//! from [`LifecycleController::start_session`] for the dispatcher to own.

use crate::{
    error::SessionError,
    pcm,
    session::{Phase, Session, SessionConfig},
};
use sonic_realtime::{
    DuplexStream, FrameSink, FrameSource, OutboundEvent, Role, StreamConnector,
    codec::{
        self, AudioConfiguration, INPUT_SAMPLE_RATE, MediaConfiguration, PromptEnd, PromptStart,
        SessionEnd, SessionStart, TurnDetectionConfiguration,
    },
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct Link {
    session: Option<Session>,
    sink: Option<Box<dyn FrameSink>>,
}

impl Link {
    fn phase(&self) -> Phase {
        self.session.as_ref().map_or(Phase::Idle, |s| s.phase)
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some(session) = self.session.as_mut() {
            session.phase = phase;
        }
    }

    /// Returns `(prompt_id, content_id)` for the given content selector.
    fn ids(&self, content: impl Fn(&Session) -> &str) -> Result<(String, String), SessionError> {
        let session = self.session.as_ref().ok_or(SessionError::NotActive)?;
        Ok((session.prompt_id.clone(), content(session).to_string()))
    }
}

pub struct LifecycleController {
    connector: Arc<dyn StreamConnector>,
    config: SessionConfig,
    active: Arc<AtomicBool>,
    active_signal: watch::Sender<bool>,
    audio_bytes: AtomicU64,
    link: Mutex<Link>,
}

impl LifecycleController {
    pub fn new(connector: Arc<dyn StreamConnector>, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            active: Arc::new(AtomicBool::new(false)),
            active_signal: watch::channel(false).0,
            audio_bytes: AtomicU64::new(0),
            link: Mutex::new(Link::default()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The shared active flag, observed by the dispatcher and audio tasks.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    /// Follows every activation and deactivation made through the controller,
    /// including a send failure in a background task.
    pub fn watch_active(&self) -> watch::Receiver<bool> {
        self.active_signal.subscribe()
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.active_signal.send_replace(false);
    }

    /// Snapshot of the current session, if one was ever started.
    pub async fn session(&self) -> Option<Session> {
        self.link.lock().await.session.clone()
    }

    /// Duration of audio sent in the current audio segment.
    pub fn audio_sent(&self) -> Duration {
        pcm::duration_of(self.audio_bytes.load(Ordering::SeqCst), INPUT_SAMPLE_RATE)
    }

    /// Opens a stream and sends the session start, the prompt start and the
    /// system prompt content. Returns the receiving half of the stream.
    pub async fn start_session(&self, language: &str) -> Result<Box<dyn FrameSource>, SessionError> {
        let mut link = self.link.lock().await;
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }
        self.open(&mut link, language).await
    }

    pub async fn start_audio_input(&self) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.require_active()?;
        self.open_audio(&mut link).await
    }

    pub async fn send_audio_chunk(&self, pcm: &[u8]) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.require_active()?;
        if !link.session.as_ref().is_some_and(Session::accepts_input) {
            return Err(SessionError::InvalidPhase {
                operation: "send audio",
                phase: link.phase(),
            });
        }
        let (prompt, audio) = link.ids(|s| &s.audio_content_id)?;
        self.send(&mut link, &OutboundEvent::audio_input(&prompt, &audio, pcm))
            .await?;
        self.audio_bytes
            .fetch_add(pcm.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    pub async fn start_text_input(&self) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.begin_text(&mut link).await
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.text_body(&mut link, text).await
    }

    pub async fn end_text_input(&self) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.finish_text(&mut link).await
    }

    /// Sends one complete text turn. The three events go out under a single
    /// lock acquisition so no other sender interleaves with the turn.
    pub async fn run_text_turn(&self, text: &str) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        self.begin_text(&mut link).await?;
        self.text_body(&mut link, text).await?;
        self.finish_text(&mut link).await
    }

    /// Closes the open audio segment. Does nothing when no segment is open or
    /// the session is no longer active.
    pub async fn end_audio_input(&self) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        if !self.is_active() || !link.session.as_ref().is_some_and(Session::accepts_input) {
            debug!("No open audio segment to end.");
            return Ok(());
        }
        let (prompt, audio) = link.ids(|s| &s.audio_content_id)?;
        self.send(&mut link, &OutboundEvent::content_end(&prompt, &audio))
            .await?;
        link.set_phase(Phase::AudioInputEnded);
        debug!(audio_sent_ms = self.audio_sent().as_millis() as u64, "Audio input ended.");
        Ok(())
    }

    /// Sends the prompt end and session end, then closes the sending half.
    /// Does nothing when the session is already inactive.
    pub async fn end_session(&self) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        if !self.is_active() {
            debug!("Session already inactive; nothing to end.");
            return Ok(());
        }
        let phase = link.phase();
        if !matches!(phase, Phase::SystemContentSent | Phase::AudioInputEnded) {
            return Err(SessionError::InvalidPhase {
                operation: "end the session",
                phase,
            });
        }

        let result = self.finish_prompt(&mut link).await;
        self.deactivate();
        if let Some(mut sink) = link.sink.take() {
            if let Err(e) = sink.close().await {
                warn!(error = %e, "Failed to close the stream after ending the session.");
            }
        }
        if result.is_ok() {
            info!("Translation session ended.");
        }
        result
    }

    /// Best-effort close of the sending half. Errors are logged, not returned.
    pub async fn close_stream(&self) {
        let mut link = self.link.lock().await;
        self.deactivate();
        if let Some(mut sink) = link.sink.take() {
            match sink.close().await {
                Ok(()) => debug!("Stream closed."),
                Err(e) => warn!(error = %e, "Failed to close the stream."),
            }
        }
    }

    /// Opens a fresh stream and prompt scope for `language`.
    ///
    /// If an audio segment was open before the restart it is either carried
    /// over under the new prompt or reopened, depending on
    /// [`SessionConfig::reopen_audio_on_restart`].
    pub async fn restart_session(&self, language: &str) -> Result<Box<dyn FrameSource>, SessionError> {
        let mut link = self.link.lock().await;
        self.deactivate();
        if let Some(mut sink) = link.sink.take() {
            if let Err(e) = sink.close().await {
                warn!(error = %e, "Failed to close the previous stream before restarting.");
            }
        }
        let carried_audio = link
            .session
            .take()
            .filter(Session::accepts_input)
            .map(|s| s.audio_content_id);

        let source = self.open(&mut link, language).await?;
        if let Some(audio_id) = carried_audio {
            if self.config.reopen_audio_on_restart {
                self.open_audio(&mut link).await?;
            } else if let Some(session) = link.session.as_mut() {
                session.audio_content_id = audio_id;
                session.phase = Phase::AudioInputStarted;
            }
        }
        if let Some(session) = link.session.as_ref() {
            info!(prompt_id = %session.prompt_id, "Session restarted.");
        }
        Ok(source)
    }

    // --- Internal steps, called with the link lock held ---

    fn require_active(&self) -> Result<(), SessionError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SessionError::NotActive)
        }
    }

    fn require_phase(link: &Link, operation: &'static str, expected: Phase) -> Result<(), SessionError> {
        let phase = link.phase();
        if phase == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidPhase { operation, phase })
        }
    }

    async fn send(&self, link: &mut Link, event: &OutboundEvent) -> Result<(), SessionError> {
        let frame = codec::encode(event)?;
        let Some(sink) = link.sink.as_mut() else {
            self.deactivate();
            return Err(SessionError::NotActive);
        };
        if let Err(e) = sink.send(frame).await {
            self.deactivate();
            warn!(kind = event.kind(), error = %e, "Send failed; session marked inactive.");
            return Err(e.into());
        }
        trace!(kind = event.kind(), "Sent event.");
        Ok(())
    }

    async fn open(&self, link: &mut Link, language: &str) -> Result<Box<dyn FrameSource>, SessionError> {
        let DuplexStream { sink, source } = self.connector.connect().await?;
        link.sink = Some(sink);
        match self.send_setup(link, language).await {
            Ok(()) => Ok(source),
            Err(e) => {
                if let Some(mut sink) = link.sink.take() {
                    if let Err(close_err) = sink.close().await {
                        warn!(error = %close_err, "Failed to close a stream that never finished setup.");
                    }
                }
                Err(e)
            }
        }
    }

    /// Session start, prompt start and the system prompt on a freshly
    /// connected sink.
    async fn send_setup(&self, link: &mut Link, language: &str) -> Result<(), SessionError> {
        let session = Session::new(language);
        let prompt = session.prompt_id.clone();
        let system = session.system_content_id.clone();
        link.session = Some(session);
        self.audio_bytes.store(0, Ordering::SeqCst);

        let session_start = OutboundEvent::SessionStart(SessionStart {
            inference_configuration: self.config.inference.clone(),
            turn_detection_configuration: self
                .config
                .endpointing_sensitivity
                .map(|endpointing_sensitivity| TurnDetectionConfiguration {
                    endpointing_sensitivity,
                }),
        });
        self.send(link, &session_start).await?;
        link.set_phase(Phase::SessionStarted);

        let prompt_start = OutboundEvent::PromptStart(PromptStart {
            prompt_name: prompt.clone(),
            text_output_configuration: MediaConfiguration::text(),
            audio_output_configuration: AudioConfiguration::output(&self.config.voice_id),
        });
        self.send(link, &prompt_start).await?;
        link.set_phase(Phase::PromptStarted);

        let system_prompt = self.config.render_system_prompt(language);
        for event in [
            OutboundEvent::text_content_start(&prompt, &system, Role::System),
            OutboundEvent::text_input(&prompt, &system, &system_prompt),
            OutboundEvent::content_end(&prompt, &system),
        ] {
            self.send(link, &event).await?;
        }
        link.set_phase(Phase::SystemContentSent);

        self.active.store(true, Ordering::SeqCst);
        self.active_signal.send_replace(true);
        info!(prompt_id = %prompt, language, "Translation session started.");
        Ok(())
    }

    async fn open_audio(&self, link: &mut Link) -> Result<(), SessionError> {
        Self::require_phase(link, "start audio input", Phase::SystemContentSent)?;
        let (prompt, audio) = link.ids(|s| &s.audio_content_id)?;
        self.send(link, &OutboundEvent::audio_content_start(&prompt, &audio))
            .await?;
        link.set_phase(Phase::AudioInputStarted);
        self.audio_bytes.store(0, Ordering::SeqCst);
        debug!(content_id = %audio, "Audio input started.");
        Ok(())
    }

    async fn begin_text(&self, link: &mut Link) -> Result<(), SessionError> {
        self.require_active()?;
        Self::require_phase(link, "start text input", Phase::AudioInputStarted)?;
        let session = link.session.as_mut().ok_or(SessionError::NotActive)?;
        let text = session.next_text_content().to_string();
        let prompt = session.prompt_id.clone();
        self.send(link, &OutboundEvent::text_content_start(&prompt, &text, Role::User))
            .await?;
        link.set_phase(Phase::TextTurnInProgress);
        Ok(())
    }

    async fn text_body(&self, link: &mut Link, text: &str) -> Result<(), SessionError> {
        self.require_active()?;
        Self::require_phase(link, "send text", Phase::TextTurnInProgress)?;
        let (prompt, content) = link.ids(|s| &s.text_content_id)?;
        self.send(link, &OutboundEvent::text_input(&prompt, &content, text))
            .await
    }

    async fn finish_text(&self, link: &mut Link) -> Result<(), SessionError> {
        self.require_active()?;
        Self::require_phase(link, "end text input", Phase::TextTurnInProgress)?;
        let (prompt, content) = link.ids(|s| &s.text_content_id)?;
        self.send(link, &OutboundEvent::content_end(&prompt, &content))
            .await?;
        link.set_phase(Phase::AudioInputStarted);
        Ok(())
    }

    async fn finish_prompt(&self, link: &mut Link) -> Result<(), SessionError> {
        let (prompt, _) = link.ids(|s| &s.prompt_id)?;
        self.send(
            link,
            &OutboundEvent::PromptEnd(PromptEnd {
                prompt_name: prompt,
            }),
        )
        .await?;
        link.set_phase(Phase::PromptEnded);
        self.send(link, &OutboundEvent::SessionEnd(SessionEnd {}))
            .await?;
        link.set_phase(Phase::SessionEnded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use sonic_realtime::mock::MockConnector;

    fn controller_with(config: SessionConfig) -> (LifecycleController, MockConnector) {
        let connector = MockConnector::new();
        let controller = LifecycleController::new(Arc::new(connector.clone()), config);
        (controller, connector)
    }

    fn controller() -> (LifecycleController, MockConnector) {
        controller_with(SessionConfig::default())
    }

    fn body<'a>(event: &'a Value, kind: &str) -> &'a Value {
        &event["event"][kind]
    }

    #[tokio::test]
    async fn test_start_session_sends_setup_sequence() {
        let (controller, connector) = controller();
        controller.start_session("Spanish").await.unwrap();

        let connection = connector.connection(0).unwrap();
        assert_eq!(
            connection.sent_kinds(),
            vec!["sessionStart", "promptStart", "contentStart", "textInput", "contentEnd"]
        );
        let events = connection.sent_events();
        let session = controller.session().await.unwrap();
        assert_eq!(body(&events[1], "promptStart")["promptName"], session.prompt_id.as_str());
        assert_eq!(body(&events[2], "contentStart")["role"], "SYSTEM");
        let system_text = body(&events[3], "textInput")["content"].as_str().unwrap();
        assert!(system_text.contains("Spanish"));
        assert_eq!(session.phase, Phase::SystemContentSent);
        assert!(controller.is_active());
    }

    #[tokio::test]
    async fn test_start_session_twice_is_rejected() {
        let (controller, _) = controller();
        controller.start_session("Spanish").await.unwrap();
        assert!(matches!(
            controller.start_session("Spanish").await,
            Err(SessionError::AlreadyActive)
        ));
    }

    #[tokio::test]
    async fn test_inputs_rejected_before_session_start() {
        let (controller, _) = controller();
        assert!(matches!(
            controller.send_audio_chunk(&[0; 4]).await,
            Err(SessionError::NotActive)
        ));
        assert!(matches!(
            controller.run_text_turn("hello").await,
            Err(SessionError::NotActive)
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_calls_fail_with_invalid_phase() {
        let (controller, connector) = controller();
        controller.start_session("German").await.unwrap();

        assert!(matches!(
            controller.send_audio_chunk(&[0; 4]).await,
            Err(SessionError::InvalidPhase { .. })
        ));
        assert!(matches!(
            controller.start_text_input().await,
            Err(SessionError::InvalidPhase { .. })
        ));

        controller.start_audio_input().await.unwrap();
        assert!(matches!(
            controller.send_text("too early").await,
            Err(SessionError::InvalidPhase { .. })
        ));
        assert!(matches!(
            controller.start_audio_input().await,
            Err(SessionError::InvalidPhase { .. })
        ));
        // Only the five setup events and one audio content start went out.
        assert_eq!(connector.connection(0).unwrap().sent_frames().len(), 6);
    }

    #[tokio::test]
    async fn test_text_turns_use_fresh_content_ids_in_order() {
        let (controller, connector) = controller();
        controller.start_session("Italian").await.unwrap();
        controller.start_audio_input().await.unwrap();
        controller.run_text_turn("first").await.unwrap();

        controller.start_text_input().await.unwrap();
        controller.send_text("second").await.unwrap();
        controller.end_text_input().await.unwrap();

        let events = connector.connection(0).unwrap().sent_events();
        let turns: Vec<&Value> = events[6..].iter().collect();
        assert_eq!(turns.len(), 6);

        let first = body(turns[0], "contentStart")["contentName"].clone();
        let second = body(turns[3], "contentStart")["contentName"].clone();
        assert_ne!(first, second);
        for (offset, content_name) in [(0, &first), (3, &second)] {
            assert_eq!(body(turns[offset], "contentStart")["role"], "USER");
            assert_eq!(body(turns[offset + 1], "textInput")["contentName"], *content_name);
            assert_eq!(body(turns[offset + 2], "contentEnd")["contentName"], *content_name);
        }
        assert_eq!(body(turns[1], "textInput")["content"], "first");
        assert_eq!(body(turns[4], "textInput")["content"], "second");
    }

    #[tokio::test]
    async fn test_send_failure_deactivates_session() {
        let (controller, connector) = controller();
        controller.start_session("Korean").await.unwrap();
        controller.start_audio_input().await.unwrap();

        let connection = connector.connection(0).unwrap();
        connection.fail_sends();
        assert!(matches!(
            controller.send_audio_chunk(&[1, 2]).await,
            Err(SessionError::Stream(_))
        ));
        assert!(!controller.is_active());

        let sent_before = connection.sent_frames().len();
        assert!(matches!(
            controller.run_text_turn("hello").await,
            Err(SessionError::NotActive)
        ));
        assert!(matches!(
            controller.send_audio_chunk(&[1, 2]).await,
            Err(SessionError::NotActive)
        ));
        assert_eq!(connection.sent_frames().len(), sent_before);
    }

    #[tokio::test]
    async fn test_end_session_sequence_is_idempotent() {
        let (controller, connector) = controller();
        controller.start_session("Korean").await.unwrap();
        controller.start_audio_input().await.unwrap();

        controller.end_audio_input().await.unwrap();
        controller.end_audio_input().await.unwrap();
        controller.end_session().await.unwrap();
        controller.end_session().await.unwrap();

        let connection = connector.connection(0).unwrap();
        let kinds = connection.sent_kinds();
        assert_eq!(
            &kinds[kinds.len() - 3..],
            &["contentEnd", "promptEnd", "sessionEnd"]
        );
        assert_eq!(kinds.iter().filter(|k| *k == "sessionEnd").count(), 1);
        assert!(connection.is_closed());
        assert!(!controller.is_active());
        assert_eq!(controller.session().await.unwrap().phase, Phase::SessionEnded);
    }

    #[tokio::test]
    async fn test_end_session_with_open_audio_is_invalid() {
        let (controller, _) = controller();
        controller.start_session("Korean").await.unwrap();
        controller.start_audio_input().await.unwrap();
        assert!(matches!(
            controller.end_session().await,
            Err(SessionError::InvalidPhase { .. })
        ));
        assert!(controller.is_active());
    }

    #[tokio::test]
    async fn test_audio_sent_tracks_segment_duration() {
        let (controller, _) = controller();
        controller.start_session("Korean").await.unwrap();
        controller.start_audio_input().await.unwrap();
        controller.send_audio_chunk(&vec![0; 16_000]).await.unwrap();
        controller.send_audio_chunk(&vec![0; 16_000]).await.unwrap();
        assert_eq!(controller.audio_sent(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_restart_carries_audio_segment_over() {
        let (controller, connector) = controller();
        controller.start_session("Thai").await.unwrap();
        controller.start_audio_input().await.unwrap();
        let before = controller.session().await.unwrap();

        controller.close_stream().await;
        assert!(!controller.is_active());
        assert!(connector.connection(0).unwrap().is_closed());

        controller.restart_session("Thai").await.unwrap();
        let after = controller.session().await.unwrap();
        assert!(controller.is_active());
        assert_ne!(before.prompt_id, after.prompt_id);
        assert_eq!(before.audio_content_id, after.audio_content_id);
        assert_eq!(after.phase, Phase::AudioInputStarted);

        controller.send_audio_chunk(&[0; 8]).await.unwrap();
        let second = connector.connection(1).unwrap();
        assert_eq!(
            second.sent_kinds(),
            vec![
                "sessionStart",
                "promptStart",
                "contentStart",
                "textInput",
                "contentEnd",
                "audioInput"
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_can_reopen_audio_segment() {
        let config = SessionConfig {
            reopen_audio_on_restart: true,
            ..SessionConfig::default()
        };
        let (controller, connector) = controller_with(config);
        controller.start_session("Thai").await.unwrap();
        controller.start_audio_input().await.unwrap();
        let before = controller.session().await.unwrap();

        controller.close_stream().await;
        controller.restart_session("Thai").await.unwrap();

        let after = controller.session().await.unwrap();
        assert_ne!(before.audio_content_id, after.audio_content_id);
        let events = connector.connection(1).unwrap().sent_events();
        assert_eq!(events.len(), 6);
        assert_eq!(body(&events[5], "contentStart")["type"], "AUDIO");
    }

    #[tokio::test]
    async fn test_start_session_propagates_connect_failure() {
        let (controller, connector) = controller();
        connector.fail_next_connects(1);
        assert!(matches!(
            controller.start_session("Thai").await,
            Err(SessionError::Stream(_))
        ));
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn test_failed_setup_closes_the_new_stream() {
        let (controller, connector) = controller();
        connector.break_new_connections();
        assert!(matches!(
            controller.start_session("Thai").await,
            Err(SessionError::Stream(_))
        ));
        assert!(!controller.is_active());
        assert!(connector.connection(0).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_failed_restart_closes_the_new_stream() {
        let (controller, connector) = controller();
        controller.start_session("Thai").await.unwrap();
        connector.break_new_connections();

        assert!(controller.restart_session("Thai").await.is_err());
        assert!(connector.connection(0).unwrap().is_closed());
        assert!(connector.connection(1).unwrap().is_closed());
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn test_watch_active_follows_send_failures() {
        let (controller, connector) = controller();
        let mut active = controller.watch_active();
        assert!(!*active.borrow_and_update());

        controller.start_session("Thai").await.unwrap();
        assert!(*active.borrow_and_update());

        connector.connection(0).unwrap().fail_sends();
        controller.start_audio_input().await.unwrap_err();
        active.changed().await.unwrap();
        assert!(!*active.borrow());
    }
}
