//! Duplex stream abstraction and its WebSocket implementation.
//!
//! A [`StreamConnector`] opens one bidirectional stream and hands back its two
//! halves. The sending half is owned by the session controller, the receiving
//! half by the response dispatcher, so neither blocks the other.

use crate::credentials::{CredentialError, CredentialProvider};
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
        protocol::{Message, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, trace};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to open stream: {0}")]
    Connect(String),
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("failed to receive frame: {0}")]
    Receive(String),
    #[error("stream is closed")]
    Closed,
    #[error("stream is in an invalid state: {0}")]
    InvalidState(String),
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
}

/// Sending half of a duplex stream.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), StreamError>;
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Receiving half of a duplex stream.
#[async_trait]
pub trait FrameSource: Send {
    /// Returns the next frame, or `Ok(None)` once the remote side has ended
    /// the stream cleanly.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, StreamError>;
}

pub struct DuplexStream {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Opens new duplex streams. Called once per session start and once per
/// restart.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<DuplexStream, StreamError>;
}

// --- WebSocket implementation ---

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the bidirectional streaming endpoint over a WebSocket,
/// presenting the provider's token as a bearer credential.
pub struct WebSocketConnector {
    endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn connect(&self) -> Result<DuplexStream, StreamError> {
        let token = self.credentials.bearer_token().await?;

        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| StreamError::Connect(format!("invalid bearer token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        info!(endpoint = %self.endpoint, "Connected to the bidirectional stream.");

        let (sink, source) = ws_stream.split();
        Ok(DuplexStream {
            sink: Box::new(WebSocketSink { inner: sink }),
            source: Box::new(WebSocketSource { inner: source }),
        })
    }
}

pub struct WebSocketSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), StreamError> {
        self.inner
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| map_ws_error(e, StreamError::Send))
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.inner
            .close()
            .await
            .map_err(|e| map_ws_error(e, StreamError::Send))
    }
}

pub struct WebSocketSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        loop {
            let message = match self.inner.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(map_ws_error(e, StreamError::Receive)),
                None => return Ok(None),
            };
            match message {
                Message::Binary(bytes) => return Ok(Some(bytes.to_vec())),
                Message::Text(text) => return Ok(Some(text.as_str().as_bytes().to_vec())),
                Message::Close(Some(frame)) if frame.code != CloseCode::Normal => {
                    // Service-side failures such as an exceeded stream length
                    // arrive as the close reason.
                    return Err(StreamError::Receive(format!(
                        "stream closed with code {}: {}",
                        u16::from(frame.code),
                        frame.reason.as_str()
                    )));
                }
                Message::Close(_) => {
                    debug!("Stream closed normally by the service.");
                    return Ok(None);
                }
                other => trace!(?other, "Ignoring control frame."),
            }
        }
    }
}

fn map_ws_error(err: WsError, otherwise: fn(String) -> StreamError) -> StreamError {
    match err {
        WsError::ConnectionClosed => StreamError::Closed,
        WsError::AlreadyClosed => {
            StreamError::InvalidState("operation on an already closed stream".to_string())
        }
        other => otherwise(other.to_string()),
    }
}
