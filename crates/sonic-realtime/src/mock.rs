//! In-memory duplex transport.
//!
//! [`MockConnector`] records every stream it opens. Tests script inbound
//! frames through the returned [`MockConnection`] and inspect what the client
//! sent; a responder closure can also answer outbound events automatically,
//! which is how the services run offline with `SONIC_PROVIDER=mock`.

use crate::transport::{DuplexStream, FrameSink, FrameSource, StreamConnector, StreamError};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc};

/// Produces inbound frames in reaction to one outbound event.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<Vec<u8>> + Send + Sync>;

enum Inbound {
    Frame(Vec<u8>),
    Error(StreamError),
    End,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ConnectorState {
    connections: Mutex<Vec<MockConnection>>,
    pending_failures: AtomicUsize,
    broken_sends: AtomicBool,
    responder: Mutex<Option<Responder>>,
    connected: Notify,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every outbound event on every future connection with `responder`.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&Value) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        *lock(&self.state.responder) = Some(Arc::new(responder));
        self
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Connections opened from now on reject every send.
    pub fn break_new_connections(&self) {
        self.state.broken_sends.store(true, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state.connections).len()
    }

    pub fn connection(&self, index: usize) -> Option<MockConnection> {
        lock(&self.state.connections).get(index).cloned()
    }

    /// Waits until the connection with the given index has been opened.
    pub async fn wait_for_connection(&self, index: usize) -> MockConnection {
        loop {
            let notified = self.state.connected.notified();
            if let Some(connection) = self.connection(index) {
                return connection;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self) -> Result<DuplexStream, StreamError> {
        let failures = &self.state.pending_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StreamError::Connect("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = MockConnection {
            inner: Arc::new(ConnectionInner {
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                fail_sends: AtomicBool::new(self.state.broken_sends.load(Ordering::SeqCst)),
                inbound: tx,
                responder: lock(&self.state.responder).clone(),
            }),
        };
        lock(&self.state.connections).push(connection.clone());
        self.state.connected.notify_waiters();

        Ok(DuplexStream {
            sink: Box::new(MockSink {
                connection: connection.clone(),
            }),
            source: Box::new(MockSource {
                inbound: rx,
                finished: false,
            }),
        })
    }
}

struct ConnectionInner {
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    inbound: mpsc::UnboundedSender<Inbound>,
    responder: Option<Responder>,
}

/// Test-side view of one opened stream.
#[derive(Clone)]
pub struct MockConnection {
    inner: Arc<ConnectionInner>,
}

impl MockConnection {
    pub fn push_frame(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.inner.inbound.send(Inbound::Frame(frame.into()));
    }

    pub fn push_event(&self, event: Value) {
        self.push_frame(event.to_string());
    }

    /// Fails the receiving half with `error` on its next read.
    pub fn push_error(&self, error: StreamError) {
        let _ = self.inner.inbound.send(Inbound::Error(error));
    }

    /// Ends the receiving half cleanly.
    pub fn finish(&self) {
        let _ = self.inner.inbound.send(Inbound::End);
    }

    /// Makes every following send fail.
    pub fn fail_sends(&self) {
        self.inner.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.sent).clone()
    }

    /// Sent frames parsed as JSON; frames that are not JSON are skipped.
    pub fn sent_events(&self) -> Vec<Value> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_slice(frame).ok())
            .collect()
    }

    /// The event kind of every sent frame, in order.
    pub fn sent_kinds(&self) -> Vec<String> {
        self.sent_events().iter().filter_map(event_kind).collect()
    }
}

/// Returns the kind of an `{"event": {<kind>: ...}}` envelope.
pub fn event_kind(event: &Value) -> Option<String> {
    event
        .get("event")?
        .as_object()?
        .keys()
        .next()
        .map(String::to_string)
}

struct MockSink {
    connection: MockConnection,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), StreamError> {
        let inner = &self.connection.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(StreamError::InvalidState(
                "send on a closed stream".to_string(),
            ));
        }
        if inner.fail_sends.load(Ordering::SeqCst) {
            return Err(StreamError::Send("broken pipe".to_string()));
        }

        let replies = match (&inner.responder, serde_json::from_slice::<Value>(&frame)) {
            (Some(responder), Ok(event)) => responder(&event),
            _ => Vec::new(),
        };
        lock(&inner.sent).push(frame);
        for reply in replies {
            self.connection.push_frame(reply);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        let inner = &self.connection.inner;
        if !inner.closed.swap(true, Ordering::SeqCst) {
            let _ = inner.inbound.send(Inbound::End);
        }
        Ok(())
    }
}

struct MockSource {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    finished: bool,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if self.finished {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(Inbound::Frame(frame)) => Ok(Some(frame)),
            Some(Inbound::Error(error)) => Err(error),
            Some(Inbound::End) | None => {
                self.finished = true;
                Ok(None)
            }
        }
    }
}

// --- Frame builders ---

/// A `contentStart` frame; `speculative` adds the generation-stage marker.
pub fn content_start_frame(role: &str, speculative: Option<bool>) -> Vec<u8> {
    let mut body = json!({ "role": role, "type": "TEXT" });
    if let Some(speculative) = speculative {
        let stage = if speculative { "SPECULATIVE" } else { "FINAL" };
        body["additionalModelFields"] = Value::String(json!({ "generationStage": stage }).to_string());
    }
    json!({ "event": { "contentStart": body } }).to_string().into_bytes()
}

pub fn text_output_frame(role: &str, content: &str) -> Vec<u8> {
    json!({ "event": { "textOutput": { "role": role, "content": content } } })
        .to_string()
        .into_bytes()
}

pub fn audio_output_frame(pcm: &[u8]) -> Vec<u8> {
    let content = base64::engine::general_purpose::STANDARD.encode(pcm);
    json!({ "event": { "audioOutput": { "content": content } } })
        .to_string()
        .into_bytes()
}

/// Answers each caller text turn the way the live service would: a USER
/// transcript, a speculative ASSISTANT reply echoing the text, and a short
/// burst of silent 24 kHz audio.
pub fn echo_responder() -> impl Fn(&Value) -> Vec<Vec<u8>> + Send + Sync + 'static {
    let system_contents = Mutex::new(HashSet::new());
    move |event: &Value| {
        let Some(body) = event.get("event") else {
            return Vec::new();
        };
        if let Some(start) = body.get("contentStart") {
            if start["role"] == "SYSTEM" {
                if let Some(name) = start["contentName"].as_str() {
                    lock(&system_contents).insert(name.to_string());
                }
            }
            return Vec::new();
        }
        let Some(input) = body.get("textInput") else {
            return Vec::new();
        };
        let content_name = input["contentName"].as_str().unwrap_or_default();
        if lock(&system_contents).contains(content_name) {
            return Vec::new();
        }
        let text = input["content"].as_str().unwrap_or_default();
        vec![
            content_start_frame("USER", None),
            text_output_frame("USER", text),
            content_start_frame("ASSISTANT", Some(true)),
            text_output_frame("ASSISTANT", text),
            audio_output_frame(&[0u8; 960]),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_sent_frames_and_closes() {
        let connector = MockConnector::new();
        let mut stream = connector.connect().await.unwrap();
        stream
            .sink
            .send(br#"{"event":{"sessionStart":{}}}"#.to_vec())
            .await
            .unwrap();
        stream.sink.close().await.unwrap();

        let connection = connector.connection(0).unwrap();
        assert_eq!(connection.sent_kinds(), vec!["sessionStart"]);
        assert!(connection.is_closed());
        assert!(matches!(
            stream.sink.send(b"{}".to_vec()).await,
            Err(StreamError::InvalidState(_))
        ));
        assert_eq!(stream.source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scripted_inbound_frames() {
        let connector = MockConnector::new();
        let mut stream = connector.connect().await.unwrap();
        let connection = connector.wait_for_connection(0).await;

        connection.push_frame(b"first".to_vec());
        connection.push_error(StreamError::Receive("boom".to_string()));
        connection.finish();

        assert_eq!(
            stream.source.next_frame().await.unwrap(),
            Some(b"first".to_vec())
        );
        assert!(stream.source.next_frame().await.is_err());
        assert_eq!(stream.source.next_frame().await.unwrap(), None);
        assert_eq!(stream.source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_connect_failures_are_consumed() {
        let connector = MockConnector::new();
        connector.fail_next_connects(1);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_broken_connections_reject_sends_but_close() {
        let connector = MockConnector::new();
        connector.break_new_connections();
        let mut stream = connector.connect().await.unwrap();
        assert!(matches!(
            stream.sink.send(b"{}".to_vec()).await,
            Err(StreamError::Send(_))
        ));
        stream.sink.close().await.unwrap();

        let connection = connector.connection(0).unwrap();
        assert!(connection.sent_frames().is_empty());
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_echo_responder_skips_system_text() {
        let connector = MockConnector::new().with_responder(echo_responder());
        let mut stream = connector.connect().await.unwrap();
        let connection = connector.connection(0).unwrap();

        let system_start = json!({"event": {"contentStart": {"contentName": "sys", "role": "SYSTEM"}}});
        let system_text = json!({"event": {"textInput": {"contentName": "sys", "content": "rules"}}});
        let user_text = json!({"event": {"textInput": {"contentName": "turn", "content": "hello"}}});
        for event in [system_start, system_text, user_text] {
            stream.sink.send(event.to_string().into_bytes()).await.unwrap();
        }
        connection.finish();

        let mut replies = Vec::new();
        while let Some(frame) = stream.source.next_frame().await.unwrap() {
            replies.push(frame);
        }
        assert_eq!(replies.len(), 5);
        assert_eq!(replies[1], text_output_frame("USER", "hello"));
    }
}
