//! Routes inbound frames to the text and audio output queues.

use crate::error::SessionError;
use sonic_realtime::{Frame, FrameSource, Role, codec};
use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A piece of transcript or translation text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub role: Role,
    pub content: String,
}

impl fmt::Display for TextChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let speaker = match self.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
            Role::Tool => "Tool",
            Role::Unknown => "Unknown",
        };
        write!(f, "{}: {}", speaker, self.content)
    }
}

/// Producer ends of the output queues. Cloned into every dispatcher spawned
/// for the same logical session, so a restart keeps feeding the same queues.
#[derive(Debug, Clone)]
pub struct OutputQueues {
    pub text: UnboundedSender<TextChunk>,
    pub audio: UnboundedSender<Vec<u8>>,
}

/// How a dispatcher run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The service ended the stream, or the session went inactive.
    StreamClosed,
    /// The stream outlived its maximum length; the session needs a restart.
    StreamLengthExceeded,
}

pub type DispatcherHandle = JoinHandle<Result<DispatchOutcome, SessionError>>;

#[derive(Debug, Default)]
struct Speaker {
    role: Option<Role>,
    speculative: bool,
}

pub struct Dispatcher {
    source: Box<dyn FrameSource>,
    outputs: OutputQueues,
    active: Arc<AtomicBool>,
    speaker: Speaker,
}

impl Dispatcher {
    pub fn new(source: Box<dyn FrameSource>, outputs: OutputQueues, active: Arc<AtomicBool>) -> Self {
        Self {
            source,
            outputs,
            active,
            speaker: Speaker::default(),
        }
    }

    pub fn spawn(self) -> DispatcherHandle {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> Result<DispatchOutcome, SessionError> {
        while self.active.load(Ordering::SeqCst) {
            match self.source.next_frame().await {
                Ok(Some(frame)) => self.dispatch(&frame),
                Ok(None) => {
                    info!("Stream ended by the service.");
                    return Ok(DispatchOutcome::StreamClosed);
                }
                Err(e) => return self.on_stream_error(e.into()),
            }
        }
        debug!("Session inactive; dispatcher stopping.");
        Ok(DispatchOutcome::StreamClosed)
    }

    fn on_stream_error(&self, err: SessionError) -> Result<DispatchOutcome, SessionError> {
        if err.is_invalid_state() && !self.active.load(Ordering::SeqCst) {
            debug!(error = %err, "Ignoring stream error on an inactive session.");
            return Ok(DispatchOutcome::StreamClosed);
        }
        if err.is_stream_length_exceeded() {
            self.active.store(false, Ordering::SeqCst);
            warn!(error = %err, "Stream exceeded its maximum length.");
            return Ok(DispatchOutcome::StreamLengthExceeded);
        }
        Err(err)
    }

    fn dispatch(&mut self, raw: &[u8]) {
        let frame = match codec::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable frame.");
                return;
            }
        };

        match frame {
            Frame::ContentStart { role, speculative } => {
                self.speaker.role = Some(role);
                if let Some(speculative) = speculative {
                    self.speaker.speculative = speculative;
                }
                trace!(%role, speculative = self.speaker.speculative, "Content started.");
            }
            Frame::TextOutput { role, content } => {
                let Some(role) = self.speaker.role.or(role) else {
                    trace!("Dropping text output with no known speaker.");
                    return;
                };
                let visible = match role {
                    Role::User => true,
                    Role::Assistant => self.speaker.speculative,
                    _ => false,
                };
                if visible && self.outputs.text.send(TextChunk { role, content }).is_err() {
                    debug!("Text output queue closed; dropping text.");
                }
            }
            Frame::AudioOutput { bytes } => {
                if self.outputs.audio.send(bytes).is_err() {
                    debug!("Audio output queue closed; dropping audio.");
                }
            }
            Frame::Other { kind } => trace!(kind = %kind, "Ignoring event."),
        }
    }
}
