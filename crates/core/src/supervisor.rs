//! The translation entry point.
//!
//! [`Translator::translate`] opens a session and hands back a
//! [`TranslatorHandle`]. A supervisor task then owns the session: it races
//! caller input against the dispatcher, restarts the stream when it outgrows
//! its maximum length, and tears everything down exactly once when the caller
//! stops or the session fails.

use crate::{
    audio::{AudioSink, AudioSource, ChannelSink, spawn_capture, spawn_keepalive, spawn_playback},
    dispatcher::{DispatchOutcome, Dispatcher, DispatcherHandle, OutputQueues, TextChunk},
    error::SessionError,
    lifecycle::LifecycleController,
    session::{InputMode, SessionConfig},
};
use sonic_realtime::{FrameSource, Role, StreamConnector, codec::lossy_text};
use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// How long a failed turn waits for the dispatcher to report why the session
/// went inactive.
const TURN_FAILURE_GRACE: Duration = Duration::from_millis(250);

/// Externally visible state of a translator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Active,
    Reconnecting,
    Stopped,
    Failed(String),
}

impl SessionStatus {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Active | SessionStatus::Reconnecting
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Reconnecting => write!(f, "reconnecting"),
            SessionStatus::Stopped => write!(f, "stopped"),
            SessionStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug)]
enum Input {
    Text(String),
    Stop,
}

/// Timing of the [`TranslatorHandle::translate_text`] completion heuristic.
#[derive(Debug, Clone, Copy)]
pub struct TurnTimeouts {
    /// Upper bound on the whole wait.
    pub overall: Duration,
    /// How long each poll of the text output queue waits.
    pub poll: Duration,
    /// Consecutive empty polls, after an assistant chunk, that end the wait.
    pub idle_polls: u32,
    /// Extra time given to trailing audio once the text is complete.
    pub settle: Duration,
}

impl Default for TurnTimeouts {
    fn default() -> Self {
        Self {
            overall: Duration::from_secs(30),
            poll: Duration::from_millis(1500),
            idle_polls: 3,
            settle: Duration::from_secs(1),
        }
    }
}

/// Outcome of [`TranslatorHandle::translate_text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    /// Concatenated assistant text, or the submitted text when no assistant
    /// output arrived in time.
    pub translation: String,
    /// Every chunk received while waiting, in arrival order.
    pub chunks: Vec<TextChunk>,
}

/// Builder for one translation session.
pub struct Translator {
    connector: Arc<dyn StreamConnector>,
    config: SessionConfig,
    audio_sink: Option<Box<dyn AudioSink>>,
    microphone: Option<Box<dyn AudioSource>>,
}

impl Translator {
    pub fn new(connector: Arc<dyn StreamConnector>, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            audio_sink: None,
            microphone: None,
        }
    }

    /// Plays translated audio through `sink` instead of queuing it for
    /// [`TranslatorHandle::drain_audio`].
    pub fn with_audio_sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.audio_sink = Some(sink);
        self
    }

    /// Streams live audio from `source` in place of the silence keepalive.
    pub fn with_microphone(mut self, source: Box<dyn AudioSource>) -> Self {
        self.config.input_mode = InputMode::Speech;
        self.microphone = Some(source);
        self
    }

    /// Starts a session translating into `language`.
    ///
    /// Returns once the session is set up and the audio segment is open; the
    /// supervisor keeps running in the background until the handle is stopped
    /// or dropped.
    pub async fn translate(self, language: &str) -> Result<TranslatorHandle, SessionError> {
        let Translator {
            connector,
            config,
            audio_sink,
            microphone,
        } = self;

        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Starting);

        let (sink, player_rx): (Box<dyn AudioSink>, _) = match audio_sink {
            Some(sink) => (sink, None),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Box::new(ChannelSink::new(tx)), Some(rx))
            }
        };

        let mut supervisor = Supervisor {
            controller: Arc::new(LifecycleController::new(connector, config)),
            language: language.to_string(),
            outputs: OutputQueues {
                text: text_tx,
                audio: audio_tx,
            },
            input: input_rx,
            status: status_tx,
            dispatcher: None,
            playback: None,
            keepalive: None,
            capture: None,
            restarts: 0,
        };

        if let Err(e) = supervisor.start(audio_rx, sink, microphone).await {
            error!(error = %e, "Failed to start the translation session.");
            supervisor.teardown(Some(&e)).await;
            return Err(e);
        }
        supervisor.status.send_replace(SessionStatus::Active);

        let span = info_span!("translator", language = %language);
        let task = tokio::spawn(supervisor.run().instrument(span));

        Ok(TranslatorHandle {
            language: language.to_string(),
            input: input_tx,
            text_output: text_rx,
            audio_output: player_rx,
            status: status_rx,
            stopping: AtomicBool::new(false),
            task: Some(task),
        })
    }
}

struct Capture {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

struct Supervisor {
    controller: Arc<LifecycleController>,
    language: String,
    outputs: OutputQueues,
    input: mpsc::UnboundedReceiver<Input>,
    status: watch::Sender<SessionStatus>,
    dispatcher: Option<DispatcherHandle>,
    playback: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    capture: Option<Capture>,
    restarts: u32,
}

enum Event {
    Dispatcher(Result<Result<DispatchOutcome, SessionError>, tokio::task::JoinError>),
    Input(Option<Input>),
    Deactivated,
}

/// Resolves once the controller reports the session inactive.
async fn deactivated(active: &mut watch::Receiver<bool>) {
    // A closed channel means the controller is gone, which counts as inactive.
    let _ = active.wait_for(|active| !*active).await;
}

impl Supervisor {
    async fn start(
        &mut self,
        audio_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        sink: Box<dyn AudioSink>,
        microphone: Option<Box<dyn AudioSource>>,
    ) -> Result<(), SessionError> {
        let config = self.controller.config().clone();

        let source = self.controller.start_session(&self.language).await?;
        self.spawn_dispatcher(source);
        self.playback = Some(spawn_playback(
            audio_rx,
            sink,
            self.controller.active_flag(),
            config.playback_chunk_bytes,
            config.playback_yield,
        ));
        self.controller.start_audio_input().await?;

        match (config.input_mode, microphone) {
            (InputMode::Speech, Some(source)) => {
                let (shutdown, shutdown_rx) = watch::channel(false);
                let handle = spawn_capture(self.controller.clone(), source, shutdown_rx);
                self.capture = Some(Capture { handle, shutdown });
                info!("Capturing microphone audio.");
            }
            (mode, _) => {
                if mode == InputMode::Speech {
                    warn!("Speech mode without a microphone; sending silence instead.");
                }
                self.keepalive = Some(spawn_keepalive(
                    self.controller.clone(),
                    config.keepalive_chunk_bytes,
                    config.keepalive_interval,
                ));
            }
        }
        Ok(())
    }

    fn spawn_dispatcher(&mut self, source: Box<dyn FrameSource>) {
        let dispatcher = Dispatcher::new(source, self.outputs.clone(), self.controller.active_flag());
        self.dispatcher = Some(dispatcher.spawn());
    }

    async fn run(mut self) {
        let result = self.drive().await;
        if let Err(e) = &result {
            error!(error = %e, "Translation session failed.");
        }
        self.teardown(result.as_ref().err()).await;
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let mut active = self.controller.watch_active();
        loop {
            // A pending dispatcher may still report a recoverable failure after
            // the session went inactive, so it is polled first.
            let event = match self.dispatcher.as_mut() {
                Some(dispatcher) => tokio::select! {
                    biased;
                    joined = dispatcher => Event::Dispatcher(joined),
                    input = self.input.recv() => Event::Input(input),
                    _ = deactivated(&mut active) => Event::Deactivated,
                },
                None => tokio::select! {
                    biased;
                    input = self.input.recv() => Event::Input(input),
                    _ = deactivated(&mut active) => Event::Deactivated,
                },
            };

            match event {
                Event::Dispatcher(joined) => {
                    self.dispatcher = None;
                    match joined.map_err(SessionError::from).and_then(|outcome| outcome) {
                        Ok(DispatchOutcome::StreamClosed) => {
                            debug!("Dispatcher finished; waiting on input only.");
                        }
                        Ok(DispatchOutcome::StreamLengthExceeded) => self.restart().await?,
                        Err(e) => {
                            warn!(error = %e, "Dispatcher failed.");
                            self.restart().await?;
                        }
                    }
                }
                Event::Input(None) | Event::Input(Some(Input::Stop)) => {
                    info!("Stop requested.");
                    return Ok(());
                }
                Event::Input(Some(Input::Text(text))) => self.run_turn(&text).await?,
                Event::Deactivated => {
                    // A background send failed, or the stream ended and took
                    // the sending half with it.
                    warn!("Session went inactive between inputs.");
                    self.restart().await?;
                }
            }
        }
    }

    async fn run_turn(&mut self, text: &str) -> Result<(), SessionError> {
        let err = match self.controller.run_text_turn(text).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        error!(error = %err, "Text turn failed.");
        if self.controller.is_active() {
            return Ok(());
        }

        // A stream that just outgrew its length limit deactivates the session
        // before the dispatcher task completes; recover and retry the turn.
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return Err(err);
        };
        let Ok(joined) = tokio::time::timeout(TURN_FAILURE_GRACE, dispatcher).await else {
            return Err(err);
        };
        self.dispatcher = None;
        match joined.map_err(SessionError::from).and_then(|outcome| outcome) {
            Ok(DispatchOutcome::StreamClosed) => Err(err),
            Ok(DispatchOutcome::StreamLengthExceeded) | Err(_) => {
                self.restart().await?;
                if let Err(e) = self.controller.run_text_turn(text).await {
                    error!(error = %e, "Text turn failed after restart.");
                    if !self.controller.is_active() {
                        return Err(e);
                    }
                }
                Ok(())
            }
        }
    }

    /// Replaces the stream and prompt scope. The output queues and the audio
    /// tasks are kept.
    async fn restart(&mut self) -> Result<(), SessionError> {
        let max_restarts = self.controller.config().max_restarts;
        if self.restarts >= max_restarts {
            return Err(SessionError::RestartLimit(self.restarts));
        }
        self.restarts += 1;

        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
            let _ = dispatcher.await;
        }
        self.status.send_replace(SessionStatus::Reconnecting);
        self.controller.close_stream().await;
        tokio::time::sleep(self.controller.config().restart_delay).await;

        let source = self.controller.restart_session(&self.language).await?;
        self.spawn_dispatcher(source);
        self.status.send_replace(SessionStatus::Active);
        info!(
            attempt = self.restarts,
            max_restarts, "Session restarted after a stream failure."
        );
        Ok(())
    }

    /// Stops every task and ends the session. Each step checks its own state,
    /// so running this twice sends nothing the second time.
    async fn teardown(&mut self, failure: Option<&SessionError>) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
            let _ = keepalive.await;
        }
        if let Some(capture) = self.capture.take() {
            let _ = capture.shutdown.send(true);
            if let Err(e) = capture.handle.await {
                warn!(error = %e, "Capture task ended abnormally.");
            }
        }
        if let Err(e) = self.controller.end_audio_input().await {
            warn!(error = %e, "Failed to end audio input during teardown.");
        }
        if let Some(playback) = self.playback.take() {
            playback.abort();
            let _ = playback.await;
        }
        if let Err(e) = self.controller.end_session().await {
            warn!(error = %e, "Failed to end the session during teardown.");
        }
        self.controller.deactivate();
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
            let _ = dispatcher.await;
        }

        let status = match failure {
            Some(e) => SessionStatus::Failed(e.to_string()),
            None => SessionStatus::Stopped,
        };
        info!(%status, "Translator shut down.");
        self.status.send_replace(status);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Only reached with live tasks when the supervisor task itself was aborted.
        for handle in [self.keepalive.take(), self.playback.take()].into_iter().flatten() {
            handle.abort();
        }
        if let Some(capture) = self.capture.take() {
            capture.handle.abort();
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Caller-side handle to a running translator.
pub struct TranslatorHandle {
    language: String,
    input: mpsc::UnboundedSender<Input>,
    text_output: mpsc::UnboundedReceiver<TextChunk>,
    audio_output: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    status: watch::Receiver<SessionStatus>,
    stopping: AtomicBool,
    task: Option<JoinHandle<()>>,
}

impl TranslatorHandle {
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Queues one text turn.
    pub fn submit_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        if self.stopping.load(Ordering::SeqCst) || !self.status().is_running() {
            return Err(SessionError::NotActive);
        }
        self.input
            .send(Input::Text(text.into()))
            .map_err(|_| SessionError::NotActive)
    }

    /// Queues a text turn from raw bytes, replacing invalid UTF-8.
    pub fn submit_bytes(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.submit_text(lossy_text(bytes))
    }

    /// Takes all text produced so far without waiting.
    pub fn drain_text(&mut self) -> Vec<TextChunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.text_output.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    /// Takes all queued 24 kHz PCM16 audio without waiting. Always empty when
    /// the translator plays audio through its own sink.
    pub fn drain_audio(&mut self) -> Vec<u8> {
        let mut audio = Vec::new();
        if let Some(rx) = self.audio_output.as_mut() {
            while let Ok(chunk) = rx.try_recv() {
                audio.extend_from_slice(&chunk);
            }
        }
        audio
    }

    /// Asks the supervisor to shut down. Safe to call more than once.
    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            let _ = self.input.send(Input::Stop);
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Waits for the supervisor to finish.
    pub async fn join(&mut self) -> Result<(), SessionError> {
        if let Some(task) = self.task.take() {
            task.await?;
        }
        match self.status() {
            SessionStatus::Failed(reason) => Err(SessionError::TaskFailed(reason)),
            _ => Ok(()),
        }
    }

    /// Submits `text` and waits for its translation with the default timings.
    pub async fn translate_text(&mut self, text: &str) -> Result<TurnResult, SessionError> {
        self.translate_text_with(text, TurnTimeouts::default()).await
    }

    /// Submits `text` and collects output until the assistant goes quiet.
    ///
    /// The service sends no explicit end-of-turn marker, so completion is
    /// inferred: after at least one assistant chunk, `idle_polls` consecutive
    /// empty polls end the wait.
    pub async fn translate_text_with(
        &mut self,
        text: &str,
        timeouts: TurnTimeouts,
    ) -> Result<TurnResult, SessionError> {
        let stale = self.drain_text();
        if !stale.is_empty() {
            debug!(count = stale.len(), "Discarding text from earlier turns.");
        }
        self.submit_text(text)?;

        let deadline = Instant::now() + timeouts.overall;
        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut idle_polls = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                info!("Timed out waiting for the translation.");
                break;
            }
            match tokio::time::timeout(remaining.min(timeouts.poll), self.text_output.recv()).await {
                Ok(Some(chunk)) => {
                    idle_polls = 0;
                    chunks.push(chunk);
                }
                Ok(None) => break,
                Err(_) => {
                    idle_polls += 1;
                    let answered = chunks.iter().any(|c| c.role == Role::Assistant);
                    if answered && idle_polls >= timeouts.idle_polls {
                        debug!(idle_polls, "Assistant went quiet; translation complete.");
                        break;
                    }
                }
            }
        }

        let translation: String = chunks
            .iter()
            .filter(|c| c.role == Role::Assistant)
            .map(|c| c.content.as_str())
            .collect();
        let translation = if translation.is_empty() {
            text.to_string()
        } else {
            tokio::time::sleep(timeouts.settle).await;
            translation
        };
        Ok(TurnResult {
            translation,
            chunks,
        })
    }
}
