//! Audio I/O tasks: playback, microphone capture and the silence keepalive.
//!
//! Device access stays behind the [`AudioSink`] and [`AudioSource`] traits so
//! the session logic can run headless (the HTTP service) or against real
//! hardware (the console).

use crate::{error::SessionError, lifecycle::LifecycleController};
use async_trait::async_trait;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Receives 24 kHz PCM16 audio produced by the service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioSink: Send {
    async fn write(&mut self, pcm: &[u8]) -> anyhow::Result<()>;
}

/// Produces 16 kHz PCM16 audio to send to the service.
#[async_trait]
pub trait AudioSource: Send {
    /// Returns the next frame, or `None` once the source is exhausted.
    async fn read_frame(&mut self) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Forwards played audio into a channel, for callers that fetch audio
/// themselves instead of playing it on a device.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl AudioSink for ChannelSink {
    async fn write(&mut self, pcm: &[u8]) -> anyhow::Result<()> {
        self.tx
            .send(pcm.to_vec())
            .map_err(|_| anyhow::anyhow!("audio receiver dropped"))
    }
}

/// Spawns the playback task.
///
/// Each queued chunk is written in sub-chunks of at most `chunk_bytes`, with a
/// short sleep between writes. Writing stops mid-chunk when the session goes
/// inactive. The task runs until aborted or the queue closes.
pub fn spawn_playback(
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    mut sink: Box<dyn AudioSink>,
    active: Arc<AtomicBool>,
    chunk_bytes: usize,
    pause: Duration,
) -> JoinHandle<()> {
    let chunk_bytes = chunk_bytes.max(1);
    tokio::spawn(async move {
        while let Some(chunk) = queue.recv().await {
            for piece in chunk.chunks(chunk_bytes) {
                if !active.load(Ordering::SeqCst) {
                    trace!("Session inactive; dropping the rest of the audio chunk.");
                    break;
                }
                if let Err(e) = sink.write(piece).await {
                    warn!(error = %e, "Audio sink rejected a write.");
                    break;
                }
                tokio::time::sleep(pause).await;
            }
        }
        debug!("Audio output queue closed; playback finished.");
    })
}

/// Spawns the silence keepalive, which holds an idle audio segment open by
/// sending `chunk_bytes` of zeroed PCM every `interval`.
pub fn spawn_keepalive(
    controller: Arc<LifecycleController>,
    chunk_bytes: usize,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let silence = vec![0u8; chunk_bytes];
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !controller.is_active() {
                continue;
            }
            match controller.send_audio_chunk(&silence).await {
                Ok(()) => {}
                Err(SessionError::NotActive | SessionError::InvalidPhase { .. }) => {
                    trace!("Keepalive skipped; no open audio segment.");
                }
                Err(e) => debug!(error = %e, "Keepalive send failed."),
            }
        }
    })
}

/// Spawns the capture task, forwarding frames from `source` while the
/// session is active. The audio segment is always ended on the way out.
pub fn spawn_capture(
    controller: Arc<LifecycleController>,
    mut source: Box<dyn AudioSource>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("Capture shutdown requested.");
                    break;
                }
                frame = source.read_frame() => match frame {
                    Ok(Some(pcm)) => {
                        if !controller.is_active() {
                            continue;
                        }
                        if let Err(e) = controller.send_audio_chunk(&pcm).await {
                            debug!(error = %e, "Dropping captured audio.");
                        }
                    }
                    Ok(None) => {
                        info!("Audio source ended.");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Audio capture failed.");
                        break;
                    }
                },
            }
        }
        if let Err(e) = controller.end_audio_input().await {
            warn!(error = %e, "Failed to end audio input after capture.");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use base64::Engine;
    use serde_json::Value;
    use sonic_realtime::mock::MockConnector;
    use std::collections::VecDeque;

    fn all_zero_audio(events: &[Value], len: usize) -> bool {
        let silence = base64::engine::general_purpose::STANDARD.encode(vec![0u8; len]);
        events
            .iter()
            .filter_map(|e| e["event"]["audioInput"]["content"].as_str())
            .all(|content| content == silence)
    }

    struct ScriptedSource {
        frames: VecDeque<Vec<u8>>,
    }

    #[async_trait]
    impl AudioSource for ScriptedSource {
        async fn read_frame(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.frames.pop_front())
        }
    }

    struct SilentSource;

    #[async_trait]
    impl AudioSource for SilentSource {
        async fn read_frame(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
            std::future::pending().await
        }
    }

    async fn open_controller() -> (Arc<LifecycleController>, MockConnector) {
        let connector = MockConnector::new();
        let controller = Arc::new(LifecycleController::new(
            Arc::new(connector.clone()),
            SessionConfig::default(),
        ));
        controller.start_session("Korean").await.unwrap();
        controller.start_audio_input().await.unwrap();
        (controller, connector)
    }

    #[tokio::test]
    async fn test_playback_writes_bounded_sub_chunks() {
        let mut sink = MockAudioSink::new();
        sink.expect_write()
            .withf(|pcm| pcm.len() <= 1024)
            .times(3)
            .returning(|_| Ok(()));

        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let handle = spawn_playback(rx, Box::new(sink), active, 1024, Duration::from_millis(1));
        tx.send(vec![0u8; 2500]).unwrap();
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_playback_skips_audio_while_inactive() {
        let mut sink = MockAudioSink::new();
        sink.expect_write().never();

        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(false));
        let handle = spawn_playback(rx, Box::new(sink), active, 1024, Duration::from_millis(1));
        tx.send(vec![0u8; 4096]).unwrap();
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_audio() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        sink.write(&[1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
        drop(rx);
        assert!(sink.write(&[4]).await.is_err());
    }

    #[tokio::test]
    async fn test_keepalive_sends_silence_only_while_active() {
        let (controller, connector) = open_controller().await;
        let handle = spawn_keepalive(controller.clone(), 2048, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let connection = connector.connection(0).unwrap();
        let events = connection.sent_events();
        let keepalives = connection
            .sent_kinds()
            .iter()
            .filter(|k| *k == "audioInput")
            .count();
        assert!(keepalives > 0);
        assert!(all_zero_audio(&events, 2048));

        controller.deactivate();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let frozen = connection.sent_frames().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(connection.sent_frames().len(), frozen);
        handle.abort();
    }

    #[tokio::test]
    async fn test_capture_forwards_frames_and_ends_segment() {
        let (controller, connector) = open_controller().await;
        let source = ScriptedSource {
            frames: VecDeque::from(vec![vec![1u8; 320], vec![2u8; 320]]),
        };
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_capture(controller.clone(), Box::new(source), shutdown_rx)
            .await
            .unwrap();

        let kinds = connector.connection(0).unwrap().sent_kinds();
        assert_eq!(&kinds[6..], &["audioInput", "audioInput", "contentEnd"]);
        assert_eq!(controller.audio_sent(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_capture_shutdown_ends_segment() {
        let (controller, connector) = open_controller().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_capture(controller.clone(), Box::new(SilentSource), shutdown_rx);
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let kinds = connector.connection(0).unwrap().sent_kinds();
        assert_eq!(kinds.last().map(String::as_str), Some("contentEnd"));
    }
}
